/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! A newtype for the identifiers the sync machinery deals in (outbox entry
//! ids and synthetic row ids). More explicit than passing `String`s around,
//! and the one place that knows what a freshly minted id looks like.

#[cfg(feature = "rusqlite_support")]
mod rusqlite_support;

#[cfg(feature = "serde_support")]
mod serde_support;

use std::fmt;

#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Guid(String);

impl Guid {
    /// A new random id: 32 lowercase hex characters (128 bits), the same
    /// shape the change-capture triggers mint with
    /// `lower(hex(randomblob(16)))`.
    #[cfg(feature = "random")]
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let mut s = String::with_capacity(32);
        for b in bytes.iter() {
            s.push_str(&format!("{:02x}", b));
        }
        Guid(s)
    }

    #[inline]
    pub fn new(s: &str) -> Self {
        Guid(s.into())
    }

    #[inline]
    pub fn from_string(s: String) -> Self {
        Guid(s)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn into_string(self) -> String {
        self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<String> for Guid {
    #[inline]
    fn from(s: String) -> Self {
        Guid(s)
    }
}

impl From<&str> for Guid {
    #[inline]
    fn from(s: &str) -> Self {
        Guid(s.into())
    }
}

impl From<Guid> for String {
    #[inline]
    fn from(g: Guid) -> Self {
        g.0
    }
}

impl AsRef<str> for Guid {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for Guid {
    type Target = str;
    #[inline]
    fn deref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Guid {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Guid {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:?})", self.0)
    }
}
