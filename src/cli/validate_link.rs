use serde::Serialize;

use crate::error::Result;
use crate::link::{LinkDescriptor, Scope};

#[derive(Serialize)]
struct Validation<'a> {
    descriptor: &'a str,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<Scope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    permission_set_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    principal_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Check each descriptor against the link grammar and print one JSON line
/// per descriptor. Returns whether every descriptor was valid.
pub async fn run(descriptors: &[String]) -> Result<bool> {
    let mut all_valid = true;

    for descriptor in descriptors {
        let validation = match descriptor.parse::<LinkDescriptor>() {
            Ok(parsed) => Validation {
                descriptor,
                valid: true,
                scope: Some(parsed.scope),
                permission_set_name: Some(parsed.permission_set_name),
                principal_name: Some(parsed.principal_name),
                error: None,
            },
            Err(e) => {
                all_valid = false;
                Validation {
                    descriptor,
                    valid: false,
                    scope: None,
                    permission_set_name: None,
                    principal_name: None,
                    error: Some(e.to_string()),
                }
            }
        };
        println!("{}", serde_json::to_string(&validation)?);
    }

    Ok(all_valid)
}
