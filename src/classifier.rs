use serde::Deserialize;

/// Label given to articles that match none of the configured topics.
pub const FALLBACK_TOPIC: &str = "Cits";

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Topic {
    pub name: String,
    pub keywords: Vec<String>,
}

impl Topic {
    pub fn new(name: &str, keywords: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }
}

/// The built-in topic table. Earlier topics win when text matches several.
pub fn default_topics() -> Vec<Topic> {
    vec![
        Topic::new("Ukraina", &["ukrain", "kijiv", "kyiv", "donbas", "kriev"]),
        Topic::new("AI", &["ai", "mākslīg", "machine learning", "chatgpt"]),
        Topic::new("Klimats", &["klimat", "climate", "emis", "oglek"]),
        Topic::new("Ekonomika", &["ekonom", "infl", "bank", "market"]),
        Topic::new("Tehnoloģijas", &["tech", "tehnoloģ", "software", "startup"]),
    ]
}

/// Keyword classifier over an ordered topic list.
///
/// Matching is plain substring search over the lowercased `title summary`
/// text, so short keywords like `ai` also hit words such as "said".
#[derive(Debug, Clone)]
pub struct TopicClassifier {
    topics: Vec<Topic>,
}

impl Default for TopicClassifier {
    fn default() -> Self {
        Self::new(default_topics())
    }
}

impl TopicClassifier {
    pub fn new(topics: Vec<Topic>) -> Self {
        let topics = topics
            .into_iter()
            .map(|topic| Topic {
                keywords: topic
                    .keywords
                    .iter()
                    .map(|k| k.to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect(),
                name: topic.name,
            })
            .collect();
        Self { topics }
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn classify(&self, title: &str, summary: &str) -> &str {
        let text = format!("{} {}", title, summary).to_lowercase();

        self.topics
            .iter()
            .find(|topic| topic.keywords.iter().any(|k| text.contains(k.as_str())))
            .map(|topic| topic.name.as_str())
            .unwrap_or(FALLBACK_TOPIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_listed_topic_wins() {
        let classifier = TopicClassifier::default();
        assert_eq!(classifier.classify("AI breakthrough in Kyiv", ""), "Ukraina");
    }

    #[test]
    fn test_fallback_topic() {
        let classifier = TopicClassifier::default();
        assert_eq!(
            classifier.classify("Local football results", "Nothing to see"),
            FALLBACK_TOPIC
        );
        assert_eq!(classifier.classify("", ""), FALLBACK_TOPIC);
    }

    #[test]
    fn test_substring_matching_is_not_word_bounded() {
        let classifier = TopicClassifier::default();
        // "said" contains "ai"
        assert_eq!(classifier.classify("Minister said nothing", ""), "AI");
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let classifier = TopicClassifier::default();
        assert_eq!(classifier.classify("CLIMATE SUMMIT", ""), "Klimats");
        assert_eq!(classifier.classify("", "Central BANK raises rates"), "Ekonomika");
    }

    #[test]
    fn test_summary_is_searched() {
        let classifier = TopicClassifier::default();
        assert_eq!(
            classifier.classify("Quarterly update", "New software startup opens"),
            "Tehnoloģijas"
        );
    }

    #[test]
    fn test_non_ascii_keywords() {
        let classifier = TopicClassifier::default();
        assert_eq!(classifier.classify("Mākslīgais intelekts skolās", ""), "AI");
        assert_eq!(classifier.classify("Tehnoloģiju nedēļa", ""), "Tehnoloģijas");
    }

    #[test]
    fn test_custom_topic_order_is_respected() {
        let classifier = TopicClassifier::new(vec![
            Topic::new("Second", &["kyiv"]),
            Topic::new("First", &["ai"]),
        ]);
        assert_eq!(classifier.classify("AI breakthrough in Kyiv", ""), "Second");
    }

    #[test]
    fn test_custom_keywords_are_lowercased() {
        let classifier = TopicClassifier::new(vec![Topic {
            name: "Sport".to_string(),
            keywords: vec!["FOOTBALL".to_string(), "".to_string()],
        }]);
        assert_eq!(classifier.classify("football final", ""), "Sport");
        // Empty keywords are dropped rather than matching everything
        assert_eq!(classifier.classify("weather", ""), FALLBACK_TOPIC);
    }

    #[test]
    fn test_default_table_order() {
        let names: Vec<_> = default_topics().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["Ukraina", "AI", "Klimats", "Ekonomika", "Tehnoloģijas"]
        );
    }
}
