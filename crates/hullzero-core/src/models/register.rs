use chrono::NaiveDate;
use serde::Serialize;

/// Country dialing code every registered phone number is filed under
pub const PHONE_COUNTRY_CODE: &str = "55";
/// Address country used when the form leaves it blank
pub const DEFAULT_ADDRESS_COUNTRY: &str = "BR";

/// Account creation payload. Document numbers, phone numbers and postal
/// codes travel as bare digits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub credentials: RegisterCredentials,
    pub profile: RegisterProfile,
    pub phone_numbers: Vec<PhoneNumber>,
    pub addresses: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterCredentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterProfile {
    pub full_name: String,
    pub cpf: String,
    pub nickname: String,
    /// Serialized as `YYYY-MM-DD`
    #[serde(rename = "birthdate")]
    pub birth_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhoneType {
    Mobile,
    Home,
    Work,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumber {
    pub country_code: String,
    /// Area code followed by the subscriber number
    pub number: String,
    #[serde(rename = "type")]
    pub kind: PhoneType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub country_code: String,
    pub postal_code: String,
    pub line_address: String,
}

/// Keep only the ASCII digits of `s`
pub fn digits_only(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}
