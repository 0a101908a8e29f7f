//! Message template personalization using `{{field}}` placeholders.

use crate::types::Customer;

/// Renders a campaign template for one customer. Placeholders the customer
/// cannot resolve are left in the output verbatim.
pub fn personalize(template: &str, customer: &Customer) -> String {
    render_with(template, |name| customer.attribute(name))
}

/// Renders a template with an arbitrary lookup. Whitespace inside the braces
/// is ignored (`{{ name }}` and `{{name}}` are equivalent).
pub fn render_with<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let raw = &rest[start..start + 2 + end + 2];
        let name = after_open[..end].trim();
        match lookup_placeholder(name, &lookup) {
            Some(value) => out.push_str(&value),
            None => out.push_str(raw),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

fn lookup_placeholder<F>(name: &str, lookup: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    lookup(name)
}

/// Placeholder names referenced by a template, in order of first use.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };
        let name = after_open[..end].trim();
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        rest = &after_open[end + 2..];
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer() -> Customer {
        Customer::new("c-1", "Ada Lovelace", "ada@example.com")
            .with_spend(1500.0, 3)
            .with_visits(6)
    }

    #[test]
    fn test_substitutes_known_fields() {
        let rendered = personalize(
            "Hi {{name}}, you have spent {{ total_spend }} over {{total_orders}} orders",
            &customer(),
        );
        assert_eq!(
            rendered,
            "Hi Ada Lovelace, you have spent 1500 over 3 orders"
        );
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let rendered = personalize("Hello {{nickname}} from {{ location }}!", &customer());
        assert_eq!(rendered, "Hello {{nickname}} from {{ location }}!");
    }

    #[test]
    fn test_zero_values_are_rendered() {
        let c = Customer::new("c-2", "Bo", "bo@example.com");
        assert_eq!(personalize("{{visits}} visits", &c), "0 visits");
    }

    #[test]
    fn test_unterminated_placeholder() {
        assert_eq!(
            personalize("Hi {{first_name}}, see {{ this", &customer()),
            "Hi Ada, see {{ this"
        );
    }

    #[test]
    fn test_placeholders_deduplicated() {
        assert_eq!(
            placeholders("{{name}} {{ email }} {{name}}"),
            vec!["name".to_string(), "email".to_string()]
        );
    }
}
