/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! The shared core of the tunesync protocol: the table-metadata registry,
//! the row-id codec, the casing/coercion adapters, and the wire types. Both
//! the client store and the mediator build on this crate; neither side does
//! any I/O through it.

mod casing;
mod error;
mod proto;
mod tables;

pub use casing::*;
pub use error::*;
pub use proto::*;
pub use tables::*;

/// A JSON object row, as both stores and the wire deal in.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
