//! Credential routing.
//!
//! Key overrides match the entity as the user sees it, so the key is chosen
//! after normalization and before redaction can rename the entity. The
//! choice travels with the heartbeat, including through the offline queue.

use crate::adapters::credentials::ApiKeyResolver;
use crate::core::heartbeat::Heartbeat;
use crate::core::pipeline::{Next, Outcome, PipelineContext, PipelineError, Stage};

/// Pipeline stage that attaches the resolved API key to each heartbeat.
#[derive(Debug, Clone, Default)]
pub struct CredentialStage {
    resolver: ApiKeyResolver,
}

impl CredentialStage {
    #[must_use]
    pub const fn new(resolver: ApiKeyResolver) -> Self {
        Self { resolver }
    }

    fn assign(&self, heartbeat: &mut Heartbeat) {
        let has_key = heartbeat
            .api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty());
        if !has_key {
            heartbeat.api_key = self.resolver.key_for(heartbeat).map(ToString::to_string);
        }
    }
}

impl Stage for CredentialStage {
    fn name(&self) -> &'static str {
        "credentials"
    }

    fn process(
        &self,
        ctx: &PipelineContext,
        mut heartbeats: Vec<Heartbeat>,
        next: Next<'_>,
    ) -> Result<Vec<Outcome>, PipelineError> {
        for heartbeat in &mut heartbeats {
            self.assign(heartbeat);
        }
        next.run(ctx, heartbeats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::normalize::NormalizationStage;
    use crate::core::pipeline::tests::RecordingSink;
    use crate::core::pipeline::{Pipeline, RunKind};
    use crate::core::redact::{RedactionStage, SanitizeConfig};
    use regex::Regex;
    use std::sync::Arc;

    fn resolver() -> ApiKeyResolver {
        ApiKeyResolver::new(
            Some("personal".to_string()),
            vec![(Regex::new("^/work/").unwrap(), "work".to_string())],
        )
    }

    #[test]
    fn key_is_chosen_before_the_entity_is_hidden() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::live(
            sink.clone(),
            NormalizationStage::default(),
            CredentialStage::new(resolver()),
            RedactionStage::new(SanitizeConfig {
                file_patterns: vec![Regex::new("secret").unwrap()],
                ..SanitizeConfig::default()
            }),
        );

        pipeline
            .run(
                &PipelineContext::new(RunKind::Live),
                vec![
                    Heartbeat::new("/work/secret/main.py", 1.0),
                    Heartbeat::new("/home/me/notes.md", 2.0),
                ],
            )
            .unwrap();

        let delivered = sink.batches.lock().unwrap()[0].clone();
        assert_eq!(delivered[0].entity, "HIDDEN.py");
        assert_eq!(delivered[0].api_key.as_deref(), Some("work"));
        assert_eq!(delivered[1].api_key.as_deref(), Some("personal"));
    }

    #[test]
    fn explicit_key_is_kept() {
        let stage = CredentialStage::new(resolver());
        let mut h = Heartbeat::new("/work/a.rs", 1.0);
        h.api_key = Some("pinned".to_string());
        stage.assign(&mut h);
        assert_eq!(h.api_key.as_deref(), Some("pinned"));

        let mut blank = Heartbeat::new("/work/a.rs", 1.0);
        blank.api_key = Some(" ".to_string());
        stage.assign(&mut blank);
        assert_eq!(blank.api_key.as_deref(), Some("work"));
    }

    #[test]
    fn no_configured_key_leaves_field_empty() {
        let stage = CredentialStage::default();
        let mut h = Heartbeat::new("/a.rs", 1.0);
        stage.assign(&mut h);
        assert_eq!(h.api_key, None);
    }
}
