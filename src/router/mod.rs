//! Routing engine — compiled ordered rules with first-match semantics.

use regex::Regex;
use tracing::{debug, info};

use crate::config::{MailboxConfig, ProcessorConfig};
use crate::email::InboundEmail;
use crate::error::RouterError;

/// The routing decision for an email.
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub mailbox_name: String,
    /// Processor type tag. An empty config value has already been defaulted
    /// to "llm"; the dispatcher decides what to do with unrecognized tags.
    pub processor_type: String,
    pub config: Option<ProcessorConfig>,
}

/// Compiled predicates for one rule. `None` is a wildcard.
#[derive(Debug)]
struct CompiledMatch {
    from: Option<Regex>,
    to: Option<Regex>,
    subject: Option<Regex>,
}

/// A compiled routing rule. Never mutated after construction.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    /// Config-order index; lower wins.
    pub priority: usize,
    matcher: CompiledMatch,
    pub processor: ProcessorConfig,
}

impl Rule {
    /// Check whether an email satisfies every declared predicate.
    ///
    /// `from` matches the sender's bare address, `to` matches any one
    /// recipient address, `subject` matches the decoded subject. Display
    /// names are never matched.
    pub fn matches(&self, email: &InboundEmail) -> bool {
        if let Some(ref from) = self.matcher.from {
            if !from.is_match(&email.from.address) {
                return false;
            }
        }
        if let Some(ref to) = self.matcher.to {
            if !email.to.iter().any(|r| to.is_match(&r.address)) {
                return false;
            }
        }
        if let Some(ref subject) = self.matcher.subject {
            if !subject.is_match(&email.subject) {
                return false;
            }
        }
        true
    }
}

/// Routes incoming emails to the mailbox whose rule matches first.
#[derive(Debug)]
pub struct Router {
    rules: Vec<Rule>,
}

impl Router {
    /// Compile all mailbox rules. Any bad pattern fails startup.
    pub fn new(mailboxes: &[MailboxConfig]) -> Result<Self, RouterError> {
        let mut rules = Vec::with_capacity(mailboxes.len());
        for (priority, mb) in mailboxes.iter().enumerate() {
            rules.push(Rule {
                name: mb.name.clone(),
                priority,
                matcher: CompiledMatch {
                    from: compile(&mb.name, "from", &mb.matcher.from)?,
                    to: compile(&mb.name, "to", &mb.matcher.to)?,
                    subject: compile(&mb.name, "subject", &mb.matcher.subject)?,
                },
                processor: mb.processor.clone(),
            });
        }
        Ok(Self { rules })
    }

    /// Return the first matching rule's decision, or the synthetic
    /// `unmatched`/`noop` result when no rule matches.
    pub fn route(&self, email: &InboundEmail) -> RouteResult {
        for rule in &self.rules {
            if rule.matches(email) {
                let processor_type = if rule.processor.kind.is_empty() {
                    "llm".to_string()
                } else {
                    rule.processor.kind.clone()
                };
                info!(
                    mailbox = %rule.name,
                    processor = %processor_type,
                    from = %email.from.address,
                    subject = %email.subject,
                    "Email routed to mailbox"
                );
                return RouteResult {
                    mailbox_name: rule.name.clone(),
                    processor_type,
                    config: Some(rule.processor.clone()),
                };
            }
        }

        debug!(
            from = %email.from.address,
            subject = %email.subject,
            "No matching rule found, using noop"
        );
        RouteResult {
            mailbox_name: "unmatched".into(),
            processor_type: "noop".into(),
            config: None,
        }
    }

    /// All configured mailbox names, in priority order.
    pub fn mailbox_names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name.clone()).collect()
    }

    /// Look up a rule by mailbox name.
    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

fn compile(
    mailbox: &str,
    field: &'static str,
    pattern: &str,
) -> Result<Option<Regex>, RouterError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|source| RouterError::BadPattern {
            mailbox: mailbox.to_string(),
            field,
            source,
        })
}
