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
pub enum StoreError {
    #[snafu(display("{} '{}' not found", resource, name))]
    NotFound { resource: String, name: String },

    #[snafu(display("{} '{}' already exists", resource, name))]
    AlreadyExists { resource: String, name: String },

    #[snafu(display("conflict on {} '{}': {}", resource, name, message))]
    Conflict {
        resource: String,
        name: String,
        message: String,
    },

    #[snafu(display("forbidden: {}", message))]
    Forbidden { message: String },

    #[snafu(display("invalid: {}", message))]
    Invalid { message: String },

    #[snafu(display("server timeout: {}", message))]
    ServerTimeout { message: String },

    #[snafu(display("no store partition serves tenant '{}'", tenant))]
    NoRoute { tenant: String },

    #[snafu(display("transport error: {}", message))]
    Transport { message: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_no_route(&self) -> bool {
        matches!(self, StoreError::NoRoute { .. })
    }

    /// Whether the same request may succeed later without any change on our side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. }
                | StoreError::ServerTimeout { .. }
                | StoreError::Transport { .. }
        )
    }
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => {
                let message = response.message.clone();
                match response.code {
                    404 => StoreError::NotFound {
                        resource: String::new(),
                        name: message,
                    },
                    409 if response.reason == "AlreadyExists" => StoreError::AlreadyExists {
                        resource: String::new(),
                        name: message,
                    },
                    409 => StoreError::Conflict {
                        resource: String::new(),
                        name: String::new(),
                        message,
                    },
                    403 => StoreError::Forbidden { message },
                    400 | 422 => StoreError::Invalid { message },
                    504 => StoreError::ServerTimeout { message },
                    code => StoreError::Transport {
                        message: format!("{} ({code})", response.message),
                    },
                }
            }
            other => StoreError::Transport {
                message: other.to_string(),
            },
        }
    }
}
