pub mod hmac_verify;
pub mod sanitize;
