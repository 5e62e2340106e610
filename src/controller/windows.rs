//! Update windows
//!
//! Recurring UTC time ranges during which minor releases may roll out.
//! A window whose `from` is later than its `to` crosses midnight and
//! belongs to the day it starts on.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Window as written in the module settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WindowError {
    #[error("invalid window time {0:?}, expected HH:MM")]
    InvalidTime(String),

    #[error("invalid window day {0:?}")]
    InvalidDay(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateWindow {
    from: NaiveTime,
    to: NaiveTime,
    /// Empty means every day
    days: Vec<Weekday>,
}

impl UpdateWindow {
    pub fn parse(spec: &WindowSpec) -> Result<Self, WindowError> {
        let time = |value: &str| {
            NaiveTime::parse_from_str(value.trim(), "%H:%M")
                .map_err(|_| WindowError::InvalidTime(value.to_string()))
        };

        let days = spec
            .days
            .iter()
            .map(|d| Weekday::from_str(d.trim()).map_err(|_| WindowError::InvalidDay(d.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            from: time(&spec.from)?,
            to: time(&spec.to)?,
            days,
        })
    }

    fn day_enabled(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    fn contains(&self, at: DateTime<Utc>) -> bool {
        let time = at.time();
        let day = at.weekday();

        if self.from <= self.to {
            self.day_enabled(day) && self.from <= time && time < self.to
        } else {
            (self.day_enabled(day) && time >= self.from)
                || (self.day_enabled(day.pred()) && time < self.to)
        }
    }
}

/// Set of configured windows; an empty set allows every instant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateWindows(Vec<UpdateWindow>);

impl UpdateWindows {
    pub fn parse(specs: &[WindowSpec]) -> Result<Self, WindowError> {
        specs
            .iter()
            .map(UpdateWindow::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_allowed(&self, at: DateTime<Utc>) -> bool {
        self.0.is_empty() || self.0.iter().any(|w| w.contains(at))
    }

    /// First instant at or after `at` that lies inside a window
    pub fn next_allowed_time(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_allowed(at) {
            return Some(at);
        }

        let today = at.date_naive();
        (0..=7)
            .flat_map(|offset| {
                let date = today + Duration::days(offset);
                self.0
                    .iter()
                    .filter(move |w| w.day_enabled(date.weekday()))
                    .map(move |w| date.and_time(w.from).and_utc())
            })
            .filter(|start| *start > at)
            .min()
    }
}
