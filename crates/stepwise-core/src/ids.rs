use rand::Rng;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..9)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

fn generate(prefix: &str) -> String {
    format!("{}_{}_{}", prefix, chrono::Utc::now().timestamp_millis(), suffix())
}

/// Cross-service request identifier: `req_<unix-millis>_<9 base36 chars>`.
pub fn generate_request_id() -> String {
    generate("req")
}

/// Plan identifier: `plan_<unix-millis>_<9 base36 chars>`.
pub fn generate_plan_id() -> String {
    generate("plan")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_shape() {
        let id = generate_request_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "req");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].bytes().all(|b| BASE36.contains(&b)));
    }

    #[test]
    fn plan_ids_differ() {
        assert_ne!(generate_plan_id(), generate_plan_id());
    }
}
