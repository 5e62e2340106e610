use deckhouse_release::crd::release::DeckhouseRelease;
use kube::CustomResourceExt;

fn main() {
    match serde_yaml::to_string(&DeckhouseRelease::crd()) {
        Ok(crd_yaml) => print!("{}", crd_yaml),
        Err(e) => {
            eprintln!("Error serializing CRD: {}", e);
            std::process::exit(1);
        }
    }
}
