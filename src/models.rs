use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SubmitError;

pub const MIN_ATTENDEES: u32 = 1;
pub const MAX_ATTENDEES: u32 = 20;
pub const DEFAULT_ORGANIZATION: &str = "Not specified";

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]{1,64}@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$"
    )
    .unwrap();
}

// Raw form body as posted by the registration page
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationForm {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub organization: Option<String>,
    pub attendees: Option<String>,
    pub payment_method: Option<String>,
}

// Validated and sanitized submission
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub organization: String,
    pub attendees: u32,
    pub payment_method: String,
    pub total_amount: u64,
    pub remote_addr: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSummary {
    pub name: String,
    pub email: String,
    pub attendees: u32,
    pub payment_method: String,
    pub total_amount: u64,
}

#[derive(Serialize, Debug)]
pub struct SubmitResponse {
    pub success: bool,
    pub message: String,
    pub data: RegistrationSummary,
}

impl From<&Registration> for RegistrationSummary {
    fn from(reg: &Registration) -> Self {
        Self {
            name: reg.full_name.clone(),
            email: reg.email.clone(),
            attendees: reg.attendees,
            payment_method: reg.payment_method.clone(),
            total_amount: reg.total_amount,
        }
    }
}

// A lone "0" counts as not filled in, same as an empty box
fn is_blank(field: &Option<String>) -> bool {
    field
        .as_deref()
        .map(str::trim)
        .is_none_or(|v| v.is_empty() || v == "0")
}

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && !email.contains("..") && EMAIL_RE.is_match(email)
}

// Keep digits and a leading-or-not '+'
pub fn sanitize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect()
}

// "3 people" yields 3; no leading digits yields the minimum
pub fn parse_attendees(raw: &str) -> u32 {
    let trimmed = raw.trim_start();
    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let digits: String = digits.chars().take_while(|c| c.is_ascii_digit()).take(12).collect();
    let value = digits.parse::<i64>().unwrap_or(0) * sign;

    value.clamp(MIN_ATTENDEES as i64, MAX_ATTENDEES as i64) as u32
}

impl RegistrationForm {
    fn missing_fields(&self) -> Vec<&'static str> {
        let required = [
            ("fullName", &self.full_name),
            ("email", &self.email),
            ("phone", &self.phone),
            ("attendees", &self.attendees),
            ("paymentMethod", &self.payment_method),
        ];

        required
            .into_iter()
            .filter(|(_, value)| is_blank(value))
            .map(|(name, _)| name)
            .collect()
    }

    pub fn validate(
        self,
        fee_per_attendee: u64,
        remote_addr: String,
    ) -> Result<Registration, SubmitError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(SubmitError::MissingFields(
                missing.into_iter().map(String::from).collect(),
            ));
        }

        let email = self.email.unwrap_or_default().trim().to_string();
        if !is_valid_email(&email) {
            return Err(SubmitError::InvalidEmail);
        }

        let organization = if is_blank(&self.organization) {
            DEFAULT_ORGANIZATION.to_string()
        } else {
            self.organization.unwrap_or_default().trim().to_string()
        };

        let attendees = parse_attendees(self.attendees.as_deref().unwrap_or_default());

        Ok(Registration {
            full_name: self.full_name.unwrap_or_default().trim().to_string(),
            email,
            phone: sanitize_phone(self.phone.as_deref().unwrap_or_default()),
            organization,
            attendees,
            payment_method: self.payment_method.unwrap_or_default().trim().to_string(),
            total_amount: attendees as u64 * fee_per_attendee,
            remote_addr,
        })
    }
}
