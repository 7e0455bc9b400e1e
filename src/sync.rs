// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub mod oneshot;
mod wait_cell;
pub mod wait_queue;
mod wake_batch;

pub use crate::error::Closed;
pub use wait_cell::WaitCell;
pub use wait_queue::{Wait, WaitOwned, WaitQueue};
