use aho_corasick::{AhoCorasick, AhoCorasickBuilder, BuildError};

use super::{SafetyClassifier, SafetyInput, Verdict};

/// Rejects uploads whose file name or embedded text, or captions whose
/// text, contain a deny-listed keyword. Matching is case-insensitive
/// substring search. An empty list allows everything.
pub struct KeywordClassifier {
    matcher: Option<AhoCorasick>,
    keywords: Vec<String>,
    reason: String,
}

impl KeywordClassifier {
    pub fn new(keywords: &[String], reason: String) -> Result<Self, BuildError> {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        let matcher = if keywords.is_empty() {
            None
        } else {
            Some(
                AhoCorasickBuilder::new()
                    .ascii_case_insensitive(true)
                    .build(&keywords)?,
            )
        };
        Ok(Self {
            matcher,
            keywords,
            reason,
        })
    }

    fn find(&self, text: &str) -> Option<&str> {
        let matcher = self.matcher.as_ref()?;
        // The matcher only folds ASCII case; fold the rest here.
        let folded = text.to_lowercase();
        let m = matcher.find(folded.as_str())?;
        self.keywords.get(m.pattern().as_usize()).map(String::as_str)
    }
}

#[async_trait::async_trait]
impl SafetyClassifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keywords"
    }

    async fn classify(&self, input: SafetyInput<'_>) -> Verdict {
        let hit = match input {
            SafetyInput::Caption(text) => self.find(text),
            SafetyInput::Image(upload) => {
                let signals = upload.text_signals();
                signals.iter().find_map(|s| self.find(s))
            }
        };
        match hit {
            Some(keyword) => {
                tracing::debug!(keyword, "deny-listed keyword matched");
                Verdict::Rejected(self.reason.clone())
            }
            None => Verdict::Allowed,
        }
    }
}
