/// Human readable rendering of a quota amount, in currency when configured.
pub fn format_quota(quota: i64, in_currency: bool, quota_per_unit: f64) -> String {
    if in_currency && quota_per_unit > 0.0 {
        format!("${:.6} credit", quota as f64 / quota_per_unit)
    } else {
        format!("{} points of credit", quota)
    }
}
