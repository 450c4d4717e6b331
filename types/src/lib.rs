// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Protocol types shared by every palisade crate: wire messages, quorum
//! certificates, errors, metered channels and the shutdown broadcast.

#[macro_use]
pub mod error;

mod messages;
mod qc;

pub mod metered_channel;
mod shutdown;
mod transport;

pub use messages::*;
pub use qc::*;
pub use shutdown::{ConditionalBroadcastReceiver, PreSubscribedBroadcastSender};
pub use transport::Transport;

pub use error::{ConsensusError, ConsensusResult};
