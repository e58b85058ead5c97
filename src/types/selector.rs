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

//! Label selectors, evaluated with kube's [`Selector`].
//!
//! An empty selector selects every object; callers that must refuse that check
//! [`Selector::selects_all`] first.

use crate::types::error::{Error, InvalidSelectorSnafu};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

pub use kube::core::{Selector, SelectorExt};

pub fn parse_selector(selector: &LabelSelector) -> Result<Selector, Error> {
    Selector::try_from(selector.clone()).map_err(|e| {
        InvalidSelectorSnafu {
            message: e.to_string(),
        }
        .build()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = parse_selector(&LabelSelector::default()).unwrap();

        assert!(selector.selects_all());
        assert!(selector.matches(&labels(&[("app", "web")])));
        assert!(selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_match_labels_and_expressions() {
        let selector = parse_selector(&LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "tier".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["frontend".to_string(), "edge".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "canary".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
        })
        .unwrap();

        assert!(!selector.selects_all());
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "edge")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("tier", "backend")])));
        assert!(!selector.matches(&labels(&[
            ("app", "web"),
            ("tier", "edge"),
            ("canary", "true")
        ])));
        assert!(!selector.matches(&labels(&[("tier", "edge")])));
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let result = parse_selector(&LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "app".to_string(),
                operator: "Near".to_string(),
                values: None,
            }]),
        });

        assert!(matches!(result, Err(Error::InvalidSelector { .. })));
    }
}
