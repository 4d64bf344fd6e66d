use crate::error::{AppError, Result};

pub const PHONE_COUNTRY_CODE: &str = "254";
pub const PHONE_LENGTH: usize = 12;
/// First subscriber digit after the country code.
pub const PHONE_SUBSCRIBER_PREFIXES: [char; 2] = ['7', '1'];

const RECEIPT_MAX_LEN: usize = 20;

/// Validates a push-payment phone number: `254` followed by a subscriber
/// number starting with 7 or 1, twelve digits in total, nothing else.
pub fn validate_phone_number(phone: &str) -> Result<&str> {
    if phone.is_empty() {
        return Err(AppError::Validation("Phone number is required".to_string()));
    }

    if !phone.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Validation(
            "Phone number must contain digits only".to_string(),
        ));
    }

    if phone.len() != PHONE_LENGTH {
        return Err(AppError::Validation(format!(
            "Phone number must be {} digits, e.g. 254712345678",
            PHONE_LENGTH
        )));
    }

    if !phone.starts_with(PHONE_COUNTRY_CODE) {
        return Err(AppError::Validation(format!(
            "Phone number must start with country code {}",
            PHONE_COUNTRY_CODE
        )));
    }

    let subscriber_prefix = phone[PHONE_COUNTRY_CODE.len()..].chars().next();
    if !subscriber_prefix.is_some_and(|c| PHONE_SUBSCRIBER_PREFIXES.contains(&c)) {
        return Err(AppError::Validation(
            "Phone number must be a mobile number starting 2547 or 2541".to_string(),
        ));
    }

    Ok(phone)
}

/// Amounts are integral, positive and capped per deployment.
pub fn validate_amount(amount: i64, max_amount: i64) -> Result<i64> {
    if amount <= 0 {
        return Err(AppError::Validation(
            "Amount must be greater than zero".to_string(),
        ));
    }

    if amount > max_amount {
        return Err(AppError::Validation(format!(
            "Amount {} exceeds the maximum of {}",
            amount, max_amount
        )));
    }

    Ok(amount)
}

pub fn validate_reference(reference: &str) -> Result<&str> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Reference is required".to_string()));
    }
    Ok(trimmed)
}

/// Normalizes a manually entered receipt code to upper case.
pub fn normalize_receipt_code(code: &str) -> Result<String> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Transaction code is required".to_string()));
    }
    if trimmed.len() > RECEIPT_MAX_LEN || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::Validation(
            "Transaction code must be letters and digits only".to_string(),
        ));
    }
    Ok(trimmed.to_ascii_uppercase())
}
