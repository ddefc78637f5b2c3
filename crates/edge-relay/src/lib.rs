// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relay for binary UDP telemetry.
//!
//! Datagrams received by the [`listener`] are fanned out to a pub/sub topic through the
//! [`publisher`] and to a time-series table through the [`converter`] and [`batch_writer`].
//! Every hand-off goes through a bounded [`queue`] that drops instead of blocking, so a slow or
//! unreachable sink never stalls reception. [`pipeline`] assembles the stages.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch_writer;
pub mod converter;
pub mod errors;
pub mod frame;
pub mod listener;
pub mod mqtt;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod sink;
pub mod timescale;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
