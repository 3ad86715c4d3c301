pub fn pluralize(count: usize, singular: &str, plural: Option<&str>) -> String {
    if count == 1 {
        return singular.to_string();
    }

    match plural {
        Some(p) => p.to_string(),
        None => format!("{singular}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pluralizes_everything_but_one() {
        assert_eq!(pluralize(1, "collection", None), "collection");
        assert_eq!(pluralize(0, "collection", None), "collections");
        assert_eq!(pluralize(3, "batch", Some("batches")), "batches");
    }
}
