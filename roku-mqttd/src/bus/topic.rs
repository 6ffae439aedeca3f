use regex::Regex;

/// Matcher built from a topic template such as `home/roku/+/set/#`.
///
/// `+` matches one segment. A trailing `/#` also matches its parent topic,
/// as a broker does. The match is anchored at the start only, so `roku/set`
/// also matches `roku/set/den/app`.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    regex: Regex,
}

impl TopicPattern {
    pub fn new(template: &str) -> Result<Self, regex::Error> {
        let (body, tail) = match template.strip_suffix("/#") {
            Some(parent) => (parent, "(?:/|$)"),
            None => (template.strip_suffix('#').unwrap_or(template), ""),
        };
        let pattern = body
            .split('+')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("([^/]+)");
        Ok(Self {
            regex: Regex::new(&format!("^{}{}", pattern, tail))?,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }
}

/// Fill a publish template with a device slug.
///
/// The first `%s` is replaced; a template without one gets `/<slug>` appended.
pub fn format_topic(template: &str, slug: &str) -> String {
    if template.contains("%s") {
        template.replacen("%s", slug, 1)
    } else {
        format!("{}/{}", template.trim_end_matches('/'), slug)
    }
}
