use crate::error::ClassificationError;
use crate::models::MessageRecord;
use regex::Regex;

/// Categories a classifier may answer with.
pub const CATEGORIES: &[&str] = &[
    "newsletter",
    "notification",
    "automated",
    "personal",
    "business",
];

/// Semantic classification collaborator. Implementations may be remote and
/// slow; callers treat every error as "leave the category empty".
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// Pick one of `categories` for `content`.
    fn classify(&self, content: &str, categories: &[&str]) -> Result<String, ClassificationError>;
}

/// Text handed to the classifier for one message.
pub fn classification_input(msg: &MessageRecord) -> String {
    format!(
        "From: {}\nSubject: {}\n\n{}",
        msg.sender, msg.subject, msg.preview
    )
}

/// Run `classifier` and check the answer against the schema.
pub fn classify_message(
    classifier: &dyn Classifier,
    msg: &MessageRecord,
) -> Result<String, ClassificationError> {
    let answer = classifier.classify(&classification_input(msg), CATEGORIES)?;
    let answer = answer.trim().to_lowercase();
    if CATEGORIES.contains(&answer.as_str()) {
        Ok(answer)
    } else {
        Err(ClassificationError::InvalidResponse(answer))
    }
}

/// Keyword rules over the sender and subject lines.
pub struct HeuristicClassifier {
    newsletter: Regex,
    notification: Regex,
    automated: Regex,
    personal: Regex,
}

impl HeuristicClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(HeuristicClassifier {
            newsletter: Regex::new(r"(?im)^subject:.*\b(subscribe|newsletter|digest)")?,
            notification: Regex::new(r"(?im)^subject:.*\b(notification|alert|update)")?,
            automated: Regex::new(r"(?im)^from:.*\b(no-?reply|mailer-daemon)@")?,
            personal: Regex::new(r"(?im)^from:.*@(gmail|yahoo|hotmail|outlook)\.com\b")?,
        })
    }
}

impl Classifier for HeuristicClassifier {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn classify(&self, content: &str, categories: &[&str]) -> Result<String, ClassificationError> {
        let header: String = content
            .lines()
            .take_while(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let pick = if self.newsletter.is_match(&header) {
            "newsletter"
        } else if self.notification.is_match(&header) {
            "notification"
        } else if self.automated.is_match(&header) {
            "automated"
        } else if self.personal.is_match(&header) {
            "personal"
        } else {
            "business"
        };
        if categories.contains(&pick) {
            Ok(pick.to_string())
        } else {
            Err(ClassificationError::Unavailable(format!(
                "category '{}' not offered",
                pick
            )))
        }
    }
}

#[cfg(test)]
pub struct FailingClassifier;

#[cfg(test)]
impl Classifier for FailingClassifier {
    fn name(&self) -> &str {
        "failing"
    }

    fn classify(&self, _content: &str, _categories: &[&str]) -> Result<String, ClassificationError> {
        Err(ClassificationError::Unavailable("inference endpoint down".into()))
    }
}
