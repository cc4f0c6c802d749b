// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The microsecond wall-clock timestamp used throughout the measurement
//! lifecycle (spec.md §3 `AbsTime`/`RelTime` fields).

use std::time::{SystemTime, UNIX_EPOCH};

pub fn micro_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
