//! Fuzz testing for JSON cleaning and field rules.
//!
//! Feeds arbitrary bytes through the same steps JSON validation applies to a
//! request body. Cleaning and rule application must never panic, and an
//! object that passes must still hold every required field.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_validation
//! cargo +nightly fuzz run fuzz_validation -- -max_total_time=60
//! ```

#![no_main]

use api_guard::validation::{ValidationRules, clean_and_validate};
use axum::http::Method;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

const ENDPOINTS: [&str; 4] = [
    "/api/messages/",
    "/api/conversations/",
    "/api/auth/register/",
    "/api/chats/",
];

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    let rules = ValidationRules::default();

    for path in ENDPOINTS {
        let field_rules = rules.for_endpoint(path, &Method::POST);
        if let Ok(Value::Object(cleaned)) = clean_and_validate(payload.clone(), field_rules) {
            // Required fields survive cleaning
            for (field, rule) in field_rules {
                if rule.required {
                    assert!(cleaned.contains_key(field));
                }
            }
        }
    }
});
