//! Ordered greeting/signature rules for caption cleanup.
//!
//! Submissions usually arrive as "greeting, the actual caption, signature".
//! The rule set strips the first two boilerplate parts:
//! - the first line matching a greeting rule is dropped (once per body)
//! - the text is cut at the first signature rule that matches anywhere
//!
//! Rules are data: each list is evaluated in declared order and the first
//! match wins.

use regex::Regex;
use tracing::debug;

/// A greeting line to drop. Matches only when the pattern matches at the
/// start of the trimmed line.
#[derive(Debug, Clone)]
pub struct GreetingRule {
    /// Human-readable description.
    pub name: String,
    pub regex: Regex,
}

/// A signature marker. Everything from the first occurrence onward is cut.
#[derive(Debug, Clone)]
pub struct SignatureRule {
    /// Human-readable description.
    pub name: String,
    pub regex: Regex,
}

impl GreetingRule {
    fn matches(&self, line: &str) -> bool {
        self.regex.find(line).is_some_and(|m| m.start() == 0)
    }
}

/// Greeting/signature stripper.
#[derive(Debug, Clone)]
pub struct CaptionRules {
    greetings: Vec<GreetingRule>,
    signatures: Vec<SignatureRule>,
}

impl CaptionRules {
    /// Rules for the Russian/English submissions the relay receives.
    pub fn default_rules() -> Self {
        let greetings = vec![
            GreetingRule {
                name: "Добрый день / Доброе утро".into(),
                regex: Regex::new(r"(?i)^Добр.+\s.*$").unwrap(),
            },
            GreetingRule {
                name: "Коллеги,".into(),
                regex: Regex::new(r"(?i)^Коллеги,+\s*.*$").unwrap(),
            },
            GreetingRule {
                name: "Здравствуйте / Привет".into(),
                regex: Regex::new(r"(?i)^(Здравствуйте|Привет)[\s,!.]").unwrap(),
            },
            GreetingRule {
                name: "Hello / Hi / Dear".into(),
                regex: Regex::new(r"(?i)^(Hello|Hi|Dear)[\s,!.]").unwrap(),
            },
        ];

        let signatures = vec![
            SignatureRule {
                name: "Best regards,".into(),
                regex: Regex::new(r"(?i)Best\sregards,").unwrap(),
            },
            SignatureRule {
                name: "Kind regards,".into(),
                regex: Regex::new(r"(?i)Kind\sregards,").unwrap(),
            },
            SignatureRule {
                name: "Yours faithfully,".into(),
                regex: Regex::new(r"(?i)Yours\sfaithfully,").unwrap(),
            },
            SignatureRule {
                name: "Sincerely,".into(),
                regex: Regex::new(r"(?i)Sincerely,").unwrap(),
            },
            SignatureRule {
                name: "С уважением,".into(),
                regex: Regex::new(r"(?i)С\s+уважением,").unwrap(),
            },
            SignatureRule {
                name: "С наилучшими пожеланиями,".into(),
                regex: Regex::new(r"(?i)С\s+наилучшими\s+пожеланиями,").unwrap(),
            },
            SignatureRule {
                name: "-- separator".into(),
                regex: Regex::new(r"(?m)^--[ \t]*$").unwrap(),
            },
        ];

        Self {
            greetings,
            signatures,
        }
    }

    /// Create an empty rule set (for testing).
    pub fn empty() -> Self {
        Self {
            greetings: Vec::new(),
            signatures: Vec::new(),
        }
    }

    /// Append a greeting rule. It is tried after the existing ones.
    pub fn add_greeting(&mut self, name: &str, pattern: &str) -> Result<(), regex::Error> {
        self.greetings.push(GreetingRule {
            name: name.into(),
            regex: Regex::new(pattern)?,
        });
        Ok(())
    }

    /// Append a signature rule. It is tried after the existing ones.
    pub fn add_signature(&mut self, name: &str, pattern: &str) -> Result<(), regex::Error> {
        self.signatures.push(SignatureRule {
            name: name.into(),
            regex: Regex::new(pattern)?,
        });
        Ok(())
    }

    /// Strip the greeting line and signature from a plain-text body.
    pub fn clean(&self, body: &str) -> String {
        if body.is_empty() {
            return String::new();
        }

        let mut greeting_removed = false;
        let mut kept: Vec<&str> = Vec::new();
        for line in body.lines() {
            if !greeting_removed {
                let trimmed = line.trim();
                if let Some(rule) = self.greetings.iter().find(|r| r.matches(trimmed)) {
                    debug!(rule = %rule.name, "Dropped greeting line");
                    greeting_removed = true;
                    continue;
                }
            }
            kept.push(line);
        }

        let mut text = kept.join("\n");

        for rule in &self.signatures {
            if let Some(m) = rule.regex.find(&text) {
                debug!(rule = %rule.name, at = m.start(), "Cut signature");
                text.truncate(m.start());
                break;
            }
        }

        text.trim().to_string()
    }
}
