// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # trellis common facilities
//!
//! Types shared by every crate in the provisioning engine: the cluster data
//! model and its typed identifiers, the error taxonomy, the poll engine, and
//! retry policies.  Nothing here performs I/O on its own.

pub mod api;
pub mod backoff;
pub mod cmd;
pub mod poll;
pub mod typed_uuid;
