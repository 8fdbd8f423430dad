// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute provider abstraction.
//!
//! Provides the [`ComputeProvider`] trait and backends:
//! - [`HttpComputeProvider`]: JSON HTTP API client
//! - [`MockProvider`]: scriptable in-memory provider for tests

pub mod http;
pub mod mock;
pub mod traits;

pub use http::HttpComputeProvider;
pub use mock::MockProvider;
pub use traits::*;
