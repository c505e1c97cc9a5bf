/// Case-insensitive multi-valued header list.
///
/// Kept as a plain vector so this crate stays free of HTTP framework types;
/// the executor layer converts to its client's header map at the edge.
pub type Headers = Vec<(String, String)>;

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub fn header_set(headers: &mut Headers, name: &str, value: &str) {
    header_remove(headers, name);
    headers.push((name.to_string(), value.to_string()));
}

pub fn header_remove(headers: &mut Headers, name: &str) {
    headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_case_insensitive() {
        let mut headers = Headers::new();
        header_set(&mut headers, "Content-Type", "application/json");
        assert_eq!(header_get(&headers, "content-type"), Some("application/json"));
    }

    #[test]
    fn set_replaces_existing_values() {
        let mut headers = vec![("accept".to_string(), "text/html".to_string())];
        header_set(&mut headers, "Accept", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "accept"), Some("application/json"));
    }
}
