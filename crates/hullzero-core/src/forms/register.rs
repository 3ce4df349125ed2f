use chrono::{NaiveDate, Utc};

use crate::models::register::{
    digits_only, Address, PhoneNumber, PhoneType, RegisterCredentials, RegisterProfile,
    DEFAULT_ADDRESS_COUNTRY, PHONE_COUNTRY_CODE,
};
use crate::models::{LoginOptions, RegisterRequest};

use super::FieldError;

const MIN_ADDRESS_LENGTH: usize = 5;
const MAX_ADDRESS_LENGTH: usize = 255;
const MIN_PASSWORD_LENGTH: usize = 8;
const MIN_PHONE_LENGTH: usize = 8;
const MIN_FULL_NAME_LENGTH: usize = 8;
const MIN_NICKNAME_LENGTH: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct RegisterForm {
    pub postal_code: String,
    pub line_address: String,
    pub country_code: Option<String>,
    pub area_code: String,
    pub phone_number: String,
    pub email: String,
    pub password: String,
    pub confirmed_password: String,
    pub full_name: String,
    pub cpf: String,
    pub nickname: String,
    pub birth_date: Option<NaiveDate>,
    pub accepted_terms: bool,
    pub remember_me: bool,
}

/// Check `s` against a digit mask where `#` is any ASCII digit and every
/// other character must match literally.
fn matches_mask(s: &str, mask: &str) -> bool {
    s.len() == mask.len()
        && s.chars().zip(mask.chars()).all(|(c, m)| match m {
            '#' => c.is_ascii_digit(),
            _ => c == m,
        })
}

/// Loose address check: one `@`, non-empty local part, dotted domain, no spaces
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && tld.len() >= 2 && !domain.starts_with('.'),
        None => false,
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

impl RegisterForm {
    /// Run every check and collect all failures
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let today = Utc::now().date_naive();
        let mut errors = Vec::new();

        self.check_address(&mut errors);
        self.check_phone(&mut errors);
        self.check_credentials(&mut errors);
        self.check_profile(today, &mut errors);

        if !self.accepted_terms {
            errors.push(FieldError::new("terms.is_checked", "You must accept the terms of use."));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate, then build the normalized payload and the login options for
    /// the sign-in that follows registration.
    pub fn to_request(&self) -> Result<(RegisterRequest, LoginOptions), Vec<FieldError>> {
        self.validate()?;

        let birth_date = self
            .birth_date
            .ok_or_else(|| vec![FieldError::new("user.birth_date", "Enter a valid date")])?;
        let country_code = self
            .country_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_ADDRESS_COUNTRY)
            .to_uppercase();

        let request = RegisterRequest {
            credentials: RegisterCredentials {
                email: self.email.trim().to_string(),
                password: self.password.clone(),
            },
            profile: RegisterProfile {
                full_name: self.full_name.trim().to_string(),
                cpf: digits_only(&self.cpf),
                nickname: self.nickname.trim().to_string(),
                birth_date,
            },
            phone_numbers: vec![PhoneNumber {
                country_code: PHONE_COUNTRY_CODE.to_string(),
                number: digits_only(&format!("{}{}", self.area_code, self.phone_number)),
                kind: PhoneType::Mobile,
            }],
            addresses: vec![Address {
                country_code,
                postal_code: digits_only(&self.postal_code),
                line_address: self.line_address.trim().to_string(),
            }],
        };
        Ok((
            request,
            LoginOptions {
                remember_me: self.remember_me,
            },
        ))
    }

    fn check_address(&self, errors: &mut Vec<FieldError>) {
        if char_len(&self.postal_code) < 9 {
            errors.push(FieldError::new("address.postal_code", "Postal code must have 8 digits."));
        }
        if !matches_mask(&self.postal_code, "#####-###") {
            errors.push(FieldError::new("address.postal_code", "Invalid postal code."));
        }

        let line = self.line_address.trim();
        if char_len(line) < MIN_ADDRESS_LENGTH {
            errors.push(FieldError::new(
                "address.line_address",
                "Address must have at least 5 characters.",
            ));
        } else if char_len(line) > MAX_ADDRESS_LENGTH {
            errors.push(FieldError::new(
                "address.line_address",
                "Address cannot exceed 255 characters.",
            ));
        }
    }

    fn check_phone(&self, errors: &mut Vec<FieldError>) {
        if char_len(self.area_code.trim()) != 2 {
            errors.push(FieldError::new("phone.area_code", "Area code must have 2 digits."));
        }
        if char_len(self.phone_number.trim()) < MIN_PHONE_LENGTH {
            errors.push(FieldError::new(
                "phone.phone_number",
                "Phone number must have 8 or 9 digits.",
            ));
        }
    }

    fn check_credentials(&self, errors: &mut Vec<FieldError>) {
        let email = self.email.trim();
        if email.is_empty() {
            errors.push(FieldError::new("credentials.email", "Email is required."));
        } else if !is_valid_email(email) {
            errors.push(FieldError::new("credentials.email", "Please enter a valid email."));
        }

        let password = &self.password;
        if char_len(password) < MIN_PASSWORD_LENGTH {
            errors.push(FieldError::new(
                "credentials.password",
                "Password must have at least 8 characters.",
            ));
        }
        if !password.chars().any(|c| c.is_ascii_uppercase()) {
            errors.push(FieldError::new(
                "credentials.password",
                "Password must contain at least one uppercase letter.",
            ));
        }
        if !password.chars().any(|c| c.is_ascii_lowercase()) {
            errors.push(FieldError::new(
                "credentials.password",
                "Password must contain at least one lowercase letter.",
            ));
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            errors.push(FieldError::new(
                "credentials.password",
                "Password must contain at least one number.",
            ));
        }
        if !password.chars().any(|c| !c.is_ascii_alphanumeric()) {
            errors.push(FieldError::new(
                "credentials.password",
                "Password must contain at least one special character.",
            ));
        }

        if self.password != self.confirmed_password {
            errors.push(FieldError::new(
                "credentials.confirmed_password",
                "Passwords do not match.",
            ));
        }
    }

    fn check_profile(&self, today: NaiveDate, errors: &mut Vec<FieldError>) {
        if char_len(self.full_name.trim()) < MIN_FULL_NAME_LENGTH {
            errors.push(FieldError::new(
                "user.full_name",
                "Name must have at least 8 characters.",
            ));
        }
        if !matches_mask(self.cpf.trim(), "###.###.###-##") {
            errors.push(FieldError::new("user.cpf", "Invalid CPF."));
        }
        if char_len(self.nickname.trim()) < MIN_NICKNAME_LENGTH {
            errors.push(FieldError::new(
                "user.nickname",
                "Nickname must have at least 2 characters.",
            ));
        }

        match self.birth_date {
            None => errors.push(FieldError::new("user.birth_date", "Enter a valid date")),
            Some(date) => {
                let earliest = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN);
                if date < earliest {
                    errors.push(FieldError::new("user.birth_date", "Invalid date"));
                } else if date > today {
                    errors.push(FieldError::new("user.birth_date", "Enter a valid date"));
                }
            }
        }
    }
}
