//! The demo application: a counter with a label, two slices.

use std::sync::Arc;
use std::time::Duration;

use foldstore_engine::{ActionContext, Deferred};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub counter: Counter,
    pub label: Label,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub value: i64,
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub text: String,
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    Added { amount: i64 },
    Reset,
    Labeled { text: String },
}

pub fn reduce(state: &Arc<AppState>, event: &AppEvent) -> Arc<AppState> {
    match event {
        AppEvent::Added { amount: 0 } => Arc::clone(state),
        AppEvent::Added { amount } => {
            let mut next = AppState::clone(state);
            next.counter.value += amount;
            Arc::new(next)
        }
        AppEvent::Reset if state.counter.value == 0 => Arc::clone(state),
        AppEvent::Reset => {
            let mut next = AppState::clone(state);
            next.counter.value = 0;
            Arc::new(next)
        }
        AppEvent::Labeled { text } if *text == state.label.text => Arc::clone(state),
        AppEvent::Labeled { text } => {
            let mut next = AppState::clone(state);
            next.label.text = text.clone();
            Arc::new(next)
        }
    }
}

/// Pretend to fetch an increment from somewhere slow, then apply it.
pub fn fetch_increment(amount: i64, delay: Duration) -> Deferred<AppState, AppEvent> {
    Deferred::task("fetch increment", move |ctx: ActionContext<AppState, AppEvent>| async move {
        tokio::time::sleep(delay).await;
        ctx.dispatch_event(AppEvent::Added { amount });
        anyhow::Ok(())
    })
}
