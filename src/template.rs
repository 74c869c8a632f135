//! Prompt templates.
//!
//! A template is a small YAML document with a `system_prompt` and optional
//! strings that decorate each user question. Templates live under
//! `<config_dir>/templates/<name>.yaml`; `sage init` writes the default one.
//!
//! ```yaml
//! system_prompt: "You are Ledger Sage, a personal finance assistant."
//! pre_user_message_content: "Answer using only the transactions provided."
//! ```

use serde::{Deserialize, Serialize};
use std::{error::Error, fs};

/// A reusable prompt template.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatTemplate {
    /// Global instruction used as the session's system message.
    pub system_prompt: String,

    /// Extra text automatically added **before** each user question.
    #[serde(default)]
    pub pre_user_message_content: Option<String>,

    /// Extra text automatically added **after** each user question.
    #[serde(default)]
    pub post_user_message_content: Option<String>,
}

impl ChatTemplate {
    /// Wrap a user question with the template's pre/post decorations.
    pub fn decorate_question(&self, question: &str) -> String {
        let mut decorated = question.to_string();
        if let Some(pre) = &self.pre_user_message_content {
            decorated = format!("{pre} {decorated}");
        }
        if let Some(post) = &self.post_user_message_content {
            decorated = format!("{decorated} {post}");
        }
        decorated
    }
}

/// Load a template by name from `<config_dir>/templates/<name>.yaml`.
///
/// ### Errors
/// Config directory unresolvable, file missing, or YAML that does not
/// deserialize into a [`ChatTemplate`].
pub async fn load_template(name: &str) -> Result<ChatTemplate, Box<dyn Error>> {
    let path = format!("templates/{}.yaml", name);
    let config_path = crate::config_dir()?.join(&path);

    tracing::info!("Loading template: {}", config_path.display());

    let content = fs::read_to_string(config_path)?;
    let template: ChatTemplate = serde_yaml::from_str(&content)?;
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decorate_wraps_question_both_sides() {
        let template = ChatTemplate {
            system_prompt: "Be helpful".into(),
            pre_user_message_content: Some("Context first.".into()),
            post_user_message_content: Some("Answer briefly.".into()),
        };
        assert_eq!(
            template.decorate_question("What did I spend?"),
            "Context first. What did I spend? Answer briefly."
        );
    }

    #[test]
    fn decorate_is_identity_without_decorations() {
        let template = ChatTemplate {
            system_prompt: "Be helpful".into(),
            pre_user_message_content: None,
            post_user_message_content: None,
        };
        assert_eq!(template.decorate_question("hi"), "hi");
    }

    #[test]
    fn template_parses_from_yaml() {
        let yaml = r#"
system_prompt: "You are Ledger Sage."
pre_user_message_content: "Use only the provided transactions."
"#;
        let template: ChatTemplate = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(template.system_prompt, "You are Ledger Sage.");
        assert!(template.post_user_message_content.is_none());
    }
}
