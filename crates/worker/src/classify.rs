//! 把外部失败归类为 [`ErrorClass`]

use pipeline_domain::{ErrorClass, StageError};

/// 按 HTTP 状态码分类
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        401 => ErrorClass::AuthenticationFailed,
        403 => ErrorClass::PermissionDenied,
        404 | 410 => ErrorClass::NotFound,
        429 => ErrorClass::RateLimited,
        408 | 500..=599 => ErrorClass::TransientNetwork,
        _ => ErrorClass::Unknown,
    }
}

/// 按错误文本分类，配额类关键词优先于权限类
pub fn classify_message(message: &str) -> ErrorClass {
    let text = message.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

    if contains_any(&["quota"]) {
        ErrorClass::QuotaExceeded
    } else if contains_any(&["429", "too many requests", "rate limit", "rate-limit"]) {
        ErrorClass::RateLimited
    } else if contains_any(&[
        "401",
        "unauthorized",
        "sign in",
        "login required",
        "cookies are no longer valid",
    ]) {
        ErrorClass::AuthenticationFailed
    } else if contains_any(&["403", "forbidden", "access denied", "private video"]) {
        ErrorClass::PermissionDenied
    } else if contains_any(&["404", "not found", "video unavailable", "has been removed"]) {
        ErrorClass::NotFound
    } else if contains_any(&[
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "temporary failure",
        "network is unreachable",
        "502",
        "503",
        "504",
    ]) {
        ErrorClass::TransientNetwork
    } else {
        ErrorClass::Unknown
    }
}

/// HTTP 客户端错误转为阶段错误
pub fn classify_reqwest_error(err: &reqwest::Error) -> StageError {
    let class = if err.is_timeout() || err.is_connect() {
        ErrorClass::TransientNetwork
    } else if let Some(status) = err.status() {
        classify_http_status(status.as_u16())
    } else {
        classify_message(&err.to_string())
    };
    StageError::new(class, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(classify_http_status(401), ErrorClass::AuthenticationFailed);
        assert_eq!(classify_http_status(403), ErrorClass::PermissionDenied);
        assert_eq!(classify_http_status(404), ErrorClass::NotFound);
        assert_eq!(classify_http_status(429), ErrorClass::RateLimited);
        assert_eq!(classify_http_status(503), ErrorClass::TransientNetwork);
        assert_eq!(classify_http_status(418), ErrorClass::Unknown);
    }

    #[test]
    fn message_mapping() {
        assert_eq!(
            classify_message("ERROR: HTTP Error 429: Too Many Requests"),
            ErrorClass::RateLimited
        );
        assert_eq!(
            classify_message("Sign in to confirm you're not a bot"),
            ErrorClass::AuthenticationFailed
        );
        assert_eq!(
            classify_message("HTTP Error 403: Forbidden (quota exceeded)"),
            ErrorClass::QuotaExceeded
        );
        assert_eq!(classify_message("Private video"), ErrorClass::PermissionDenied);
        assert_eq!(
            classify_message("ERROR: Video unavailable"),
            ErrorClass::NotFound
        );
        assert_eq!(
            classify_message("Read timed out"),
            ErrorClass::TransientNetwork
        );
        assert_eq!(classify_message("something odd"), ErrorClass::Unknown);
    }
}
