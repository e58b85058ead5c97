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


use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    NoNamespace,

    #[snafu(display("object has no name associated"))]
    NoName,

    #[snafu(display("{} '{}' has no spec", kind, name))]
    NoSpec { kind: String, name: String },

    #[snafu(display("invalid object key '{}': expected tenant/namespace/name", key))]
    InvalidKey { key: String },

    #[snafu(display("invalid value '{}' for {}: {}", value, field, message))]
    InvalidIntOrPercent {
        field: String,
        value: String,
        message: String,
    },

    #[snafu(display("invalid label selector: {}", message))]
    InvalidSelector { message: String },

    #[snafu(display("serde_json error: {}", source))]
    SerdeJson { source: serde_json::Error },
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Error::SerdeJson { source }
    }
}
