//! vigil-runtime: consumers that react to scheduler fire events.
//!
//! Provides:
//! - The [`engine::ConversationEngine`] contract that both consumers
//!   call into
//! - The delivery seam: [`channels::DeliveryTarget`] plus the
//!   last-active [`channels::ChannelRegistry`]
//! - [`listener::JobListener`]: forwards ordinary job fires to the
//!   engine and delivers the reply
//! - [`heartbeat::Heartbeat`]: the periodic self-check with its
//!   structured reply protocol, active-hours window, and duplicate
//!   suppression
//!
//! ```text
//! scheduler ──► event log ("cron.fire")
//!                  │
//!        ┌─────────┴──────────┐
//!        ▼                    ▼
//!   JobListener           Heartbeat
//!   (all other jobs)      (its own job only)
//!        │                    │
//!        ▼                    ▼
//!     engine ──► reply ──► delivery target
//! ```
//!
//! Each consumer holds its own in-progress guard: a fire that arrives
//! while the previous one is still being handled is dropped, not
//! queued.

pub mod channels;
pub mod engine;
pub mod heartbeat;
pub mod listener;
