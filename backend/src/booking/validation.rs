use once_cell::sync::Lazy;
use regex::Regex;

use crate::availability::generator::Slot;
use crate::booking::model::CustomerInfo;
use crate::error::ValidationErrors;
use crate::sync::tags::is_embeddable;

pub const NAME_MIN_CHARS: usize = 2;
pub const NAME_MAX_CHARS: usize = 100;
pub const CONTACT_MAX_CHARS: usize = 254;
pub const NOTE_MAX_CHARS: usize = 2_000;

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
        .expect("EMAIL_REGEX pattern is valid")
});

// Optional leading +, then digits with spaces, dots, dashes or parentheses.
static PHONE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9 ().-]{6,24}$").expect("PHONE_REGEX pattern is valid"));

fn is_phone(s: &str) -> bool {
    let digits = s.chars().filter(char::is_ascii_digit).count();
    PHONE_REGEX.is_match(s) && (7..=15).contains(&digits)
}

/// Collects every field problem in a booking request rather than stopping
/// at the first one.
pub fn validate_request(
    slot: &Slot,
    customer: &CustomerInfo,
    owner_id: &str,
    note: Option<&str>,
) -> Result<(), ValidationErrors> {
    let mut errs = ValidationErrors::default();

    let name = customer.name.trim();
    let name_len = name.chars().count();
    if name_len < NAME_MIN_CHARS || name_len > NAME_MAX_CHARS {
        errs.push(
            "customer.name",
            format!("must be {NAME_MIN_CHARS} to {NAME_MAX_CHARS} characters"),
        );
    } else if name.chars().any(char::is_control) {
        errs.push("customer.name", "must not contain control characters");
    }

    let contact = customer.contact.trim();
    if contact.is_empty() {
        errs.push("customer.contact", "is required");
    } else if contact.chars().count() > CONTACT_MAX_CHARS {
        errs.push("customer.contact", format!("must be at most {CONTACT_MAX_CHARS} characters"));
    } else if !EMAIL_REGEX.is_match(contact) && !is_phone(contact) {
        errs.push("customer.contact", "must be an email address or a phone number");
    }

    if !is_embeddable(owner_id) {
        errs.push("owner_id", "must be non-empty, single-line and free of ']'");
    }

    if slot.staff_id.trim().is_empty() {
        errs.push("slot.staff_id", "is required");
    }
    if slot.duration_min == 0 {
        errs.push("slot.duration_min", "must be positive");
    }

    if let Some(n) = note {
        if n.chars().count() > NOTE_MAX_CHARS {
            errs.push("note", format!("must be at most {NOTE_MAX_CHARS} characters"));
        }
    }

    errs.into_result()
}
