use ulid::Ulid;

/// ULID run ids; lexical order follows creation time.
pub fn new_run_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
pub fn is_run_id(s: &str) -> bool {
    Ulid::from_string(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_parse_back() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert!(is_run_id(&a));
        assert!(!is_run_id("not-a-run-id"));
    }
}
