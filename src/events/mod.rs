//! Event trigger and event-decision engines.

pub mod decision;
pub mod trigger;

pub use decision::{apply_safety_guards, handle_event_decision, DecisionOutcome};
pub use trigger::{EventResult, EventTriggerEngine, PrevCycle, Trigger, TriggerConfig, TriggerType};
