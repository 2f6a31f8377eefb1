//! Shared fixtures: a two-slice app state, its events and reducer.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use foldstore_engine::Store;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub counter: Counter,
    pub profile: Profile,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub x: i64,
    pub version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub version: u32,
}

impl AppState {
    pub fn with_x(x: i64) -> Self {
        Self {
            counter: Counter { x, version: 1 },
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AppEvent {
    Add { n: i64 },
    Rename { name: String },
    /// Never changes state.
    Noop,
    /// Makes the reducer panic.
    Explode,
}

pub fn reduce(state: &Arc<AppState>, event: &AppEvent) -> Arc<AppState> {
    match event {
        AppEvent::Add { n } => {
            let mut next = AppState::clone(state);
            next.counter.x += n;
            Arc::new(next)
        }
        AppEvent::Rename { name } => {
            let mut next = AppState::clone(state);
            next.profile.name = name.clone();
            Arc::new(next)
        }
        AppEvent::Noop => Arc::clone(state),
        AppEvent::Explode => panic!("reducer exploded"),
    }
}

pub fn add(n: i64) -> AppEvent {
    AppEvent::Add { n }
}

// ---------------------------------------------------------------------------
// Recording reporter
// ---------------------------------------------------------------------------

/// Error reporter that keeps every message it receives.
#[derive(Clone, Default)]
pub struct Reports(Arc<Mutex<Vec<String>>>);

impl Reports {
    pub fn reporter(&self) -> impl Fn(&anyhow::Error, &Store<AppState, AppEvent>) + Send + Sync {
        let reports = Arc::clone(&self.0);
        move |error: &anyhow::Error, _store: &Store<AppState, AppEvent>| {
            reports.lock().unwrap().push(format!("{error:#}"));
        }
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
