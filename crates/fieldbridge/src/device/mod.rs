// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Field-device access: the three protocol clients and the bridge that
//! selects, validates and normalizes.

pub mod bridge;
pub mod clients;

pub use bridge::{Device, DeviceBridge};
pub use clients::{DeviceError, LineClient, UltimateClient, ZbcClient};
