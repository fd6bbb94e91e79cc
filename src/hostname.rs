/// Host name used for the `node` line in the rendered config and the
/// `inst_id` metric label.
pub fn instance_id() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string())
}
