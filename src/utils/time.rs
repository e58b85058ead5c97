// Copyright 2025 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Conversions between `metav1::Time` and chrono.
//!
//! `Time` is only ever built and read through its RFC 3339 serde form, which keeps this crate
//! independent of the datetime backend k8s-openapi was compiled with.

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// The current instant as an API timestamp.
pub fn now_time() -> Option<Time> {
    time_from(Utc::now())
}

/// Builds an API timestamp from a chrono instant, truncated to whole seconds like the API
/// server does. Every field holding one is optional, so is the result.
pub fn time_from(at: DateTime<Utc>) -> Option<Time> {
    let value = serde_json::Value::String(at.to_rfc3339_opts(SecondsFormat::Secs, true));
    serde_json::from_value(value).ok()
}

/// Reads an API timestamp back as a chrono instant.
pub fn to_chrono(time: &Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
