use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl UsageInfo {
    /// Quota charged for this usage: one unit per token.
    pub fn quota(&self) -> i64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }
}

/// Reads the OpenAI-style `usage` object of a response body.
pub fn parse_usage_info(response_body: &Value) -> Option<UsageInfo> {
    let usage = response_body.get("usage").filter(|u| !u.is_null())?;
    let field = |name: &str| usage.get(name).and_then(Value::as_i64).unwrap_or(0).max(0);
    Some(UsageInfo {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_usage_block() {
        let body = json!({"usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}});
        let usage = parse_usage_info(&body).unwrap();
        assert_eq!(usage.quota(), 42);
    }

    #[test]
    fn falls_back_to_sum_without_total() {
        let body = json!({"usage": {"prompt_tokens": 5, "completion_tokens": 7}});
        assert_eq!(parse_usage_info(&body).unwrap().quota(), 12);
        assert!(parse_usage_info(&json!({"usage": null})).is_none());
        assert!(parse_usage_info(&json!({})).is_none());
    }
}
