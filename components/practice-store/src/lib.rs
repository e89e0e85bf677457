/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! The client side of tunesync: a SQLite practice store whose writes are
//! captured into a durable outbox by triggers, plus the engine that drives
//! one push/pull cycle against the mediator.

mod db;
mod error;
mod outbox;
mod schema;
mod store;
pub mod sync;
mod triggers;

pub use crate::db::PracticeDb;
pub use crate::error::*;
pub use crate::outbox::{OutboxEntry, OutboxOp, OutboxStats, OutboxStatus};
pub use crate::store::PracticeStore;
pub use crate::sync::{
    SyncCycleResult, SyncEngine, SyncEngineConfig, SyncErrorInfo, SyncErrorKind, SyncTransport,
};
