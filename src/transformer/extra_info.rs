//! Free-form attribute bags for vendor fields without a canonical column.

use serde_json::{Map, Value};

use crate::entity::MICROSOFT_APP_ID;
use crate::extraction::as_text;
use crate::transforms::partition_mails;

const USER_TEXT_FIELDS: [&str; 11] = [
    "city",
    "state",
    "country",
    "streetAddress",
    "companyName",
    "securityIdentifier",
    "passwordPolicies",
    "lastPasswordChangeDateTime",
    "preferredLanguage",
    "mailNickname",
    "employeeId",
];

const GROUP_LIST_FIELDS: [&str; 3] = [
    "creationOptions",
    "resourceBehaviorOptions",
    "resourceProvisioningOptions",
];

const GROUP_TEXT_FIELDS: [&str; 5] = [
    "expirationDateTime",
    "onPremisesDomainName",
    "onPremisesNetBiosName",
    "onPremisesSamAccountName",
    "onPremisesSecurityIdentifier",
];

fn text_field(node: &Value, field: &str) -> Option<String> {
    node.get(field)
        .and_then(as_text)
        .filter(|s| !s.trim().is_empty())
}

/// Non-null entries of a string array, empty when the field is not an array.
pub(crate) fn string_list(node: &Value, field: &str) -> Vec<String> {
    match node.get(field) {
        Some(Value::Array(items)) => items.iter().filter_map(as_text).collect(),
        _ => Vec::new(),
    }
}

fn put_list(bag: &mut Map<String, Value>, key: &str, items: Vec<String>) {
    if !items.is_empty() {
        bag.insert(
            key.to_string(),
            Value::Array(items.into_iter().map(Value::String).collect()),
        );
    }
}

fn put_text(bag: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(v) = value {
        bag.insert(key.to_string(), Value::String(v));
    }
}

/// User bag: phones, proxy addresses, secondary mails, address, security
/// attributes, identities, manager and MFA registration details.
///
/// `primary_email` decides which `otherMails` entry counts as the
/// same-domain secondary address.
pub fn user_extra_info(data: &Value, primary_email: Option<&str>) -> Map<String, Value> {
    let mut bag = Map::new();

    put_list(&mut bag, "businessPhones", string_list(data, "businessPhones"));
    put_list(&mut bag, "proxyAddresses", string_list(data, "proxyAddresses"));

    let other_mails = string_list(data, "otherMails");
    let (secondary_mail, email_secondary) = partition_mails(primary_email, &other_mails);
    put_text(&mut bag, "secondaryMail", secondary_mail);
    put_text(&mut bag, "emailSecondary", email_secondary);
    put_list(&mut bag, "otherMails", other_mails);

    for field in USER_TEXT_FIELDS {
        put_text(&mut bag, field, text_field(data, field));
    }

    for field in ["identities", "manager"] {
        if let Some(items @ Value::Array(_)) = data.get(field) {
            bag.insert(field.to_string(), items.clone());
        }
    }

    match data.get("registrationDetails") {
        Some(Value::Array(details)) if !details.is_empty() => {
            bag.insert("mfaDetails".to_string(), details[0].clone());
            bag.insert("registrationDetails".to_string(), Value::Array(details.clone()));
        }
        Some(detail @ Value::Object(map)) if !map.is_empty() => {
            bag.insert("mfaDetails".to_string(), detail.clone());
            bag.insert("registrationDetails".to_string(), detail.clone());
        }
        _ => {}
    }

    bag.insert("appId".to_string(), Value::String(MICROSOFT_APP_ID.to_string()));
    bag
}

/// Group bag: creation and provisioning options, expiry and on-premises
/// directory attributes.
pub fn group_extra_info(group: &Value) -> Map<String, Value> {
    let mut bag = Map::new();
    for field in GROUP_LIST_FIELDS {
        put_list(&mut bag, field, string_list(group, field));
    }
    for field in GROUP_TEXT_FIELDS {
        put_text(&mut bag, field, text_field(group, field));
    }
    if let Some(Value::Bool(enabled)) = group.get("onPremisesSyncEnabled") {
        bag.insert("onPremisesSyncEnabled".to_string(), Value::Bool(*enabled));
    }
    bag
}

/// Role bag: inherited permissions and the raw role definition.
pub fn role_extra_info(role: &Value) -> Map<String, Value> {
    let mut bag = Map::new();
    if let Some(inherits @ Value::Array(_)) = role.get("inheritsPermissionsFrom") {
        bag.insert("inheritsPermissionsFrom".to_string(), inherits.clone());
    }
    if let Some(definition) = role.get("role_definition").filter(|v| !v.is_null()) {
        bag.insert("role_definition".to_string(), definition.clone());
    }
    bag
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_bag() {
        let data = json!({
            "businessPhones": [],
            "proxyAddresses": ["SMTP:a@x.com"],
            "otherMails": ["B@x.com", "c@other.com", "d@other.com", "nomail"],
            "city": "Oslo",
            "state": "  ",
            "registrationDetails": [{"isMfaRegistered": true}],
            "manager": [{"id": "M1"}]
        });
        let bag = user_extra_info(&data, Some("a@x.com"));

        assert!(!bag.contains_key("businessPhones"));
        assert!(!bag.contains_key("state"));
        assert_eq!(bag["secondaryMail"], json!("b@x.com"));
        assert_eq!(bag["emailSecondary"], json!("c@other.com"));
        assert_eq!(bag["city"], json!("Oslo"));
        assert_eq!(bag["mfaDetails"], json!({"isMfaRegistered": true}));
        assert_eq!(bag["manager"], json!([{"id": "M1"}]));
        assert_eq!(bag["appId"], json!(MICROSOFT_APP_ID));
    }

    #[test]
    fn test_group_and_role_bags() {
        let group = json!({
            "creationOptions": ["Team"],
            "onPremisesSyncEnabled": false,
            "onPremisesDomainName": null
        });
        let bag = group_extra_info(&group);
        assert_eq!(bag["creationOptions"], json!(["Team"]));
        assert_eq!(bag["onPremisesSyncEnabled"], json!(false));
        assert!(!bag.contains_key("onPremisesDomainName"));

        assert!(role_extra_info(&json!({"id": "R1"})).is_empty());
        let role = role_extra_info(&json!({"role_definition": {"name": "x"}}));
        assert_eq!(role["role_definition"], json!({"name": "x"}));
    }
}
