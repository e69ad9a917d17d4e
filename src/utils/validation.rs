//! Validation utilities

use crate::types::*;
use bigdecimal::BigDecimal;

/// Validate that an amount is positive
pub fn validate_positive_amount(amount: &BigDecimal) -> EngineResult<()> {
    if *amount <= BigDecimal::from(0) {
        Err(EngineError::Validation(format!(
            "amount must be positive, got {amount}"
        )))
    } else {
        Ok(())
    }
}

/// Validate a counterparty name or alias
pub fn validate_name(name: &str) -> EngineResult<()> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation(
            "name cannot be empty".to_string(),
        ));
    }

    if name.trim().len() > 100 {
        return Err(EngineError::Validation(
            "name cannot exceed 100 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate a mandatory reason (hold, soft-delete)
pub fn validate_reason(reason: &str) -> EngineResult<()> {
    if reason.trim().is_empty() {
        return Err(EngineError::Validation(
            "a reason is required".to_string(),
        ));
    }

    if reason.len() > 500 {
        return Err(EngineError::Validation(
            "reason cannot exceed 500 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate a voucher number
pub fn validate_voucher_no(voucher_no: &str) -> EngineResult<()> {
    if voucher_no.trim().is_empty() {
        return Err(EngineError::Validation(
            "voucher number cannot be empty".to_string(),
        ));
    }

    if voucher_no.len() > 50 {
        return Err(EngineError::Validation(
            "voucher number cannot exceed 50 characters".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_amounts_only() {
        assert!(validate_positive_amount(&BigDecimal::from(1)).is_ok());
        assert!(validate_positive_amount(&BigDecimal::from(0)).is_err());
        assert!(validate_positive_amount(&BigDecimal::from(-3)).is_err());
    }

    #[test]
    fn names_and_reasons_must_be_present() {
        assert!(validate_name("Acme").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_reason("duplicate entry").is_ok());
        assert!(validate_reason("").is_err());
    }
}
