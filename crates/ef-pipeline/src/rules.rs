//! Job rules: which post-processing actions apply to a task.
//!
//! A [`JobRule`] pairs an [`Expr`] over the task, its job's profile and the
//! analyzed source with a list of actions. The [`RuleEngine`] combines the
//! configured rules with the rules a profile implies on its own (burn-in
//! subtitle outputs, font extraction for ASS subtitles).

use std::path::Path;

use ef_codec::EncodingProfile;
use ef_core::{Container, Error, Result, SubtitleCodec};
use ef_dispatch::{JobType, TaskSpec};
use ef_probe::MediaInfo;
use serde::{Deserialize, Serialize};

use crate::actions::PostActionConfig;

/// What a rule is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub spec: &'a TaskSpec,
    pub profile: &'a EncodingProfile,
    pub media: &'a MediaInfo,
}

impl RuleContext<'_> {
    fn job_type(&self) -> JobType {
        self.spec.job_type()
    }
}

/// A leaf condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Condition {
    /// The task is one of these types.
    TaskType(Vec<JobType>),
    /// The profile's output container is one of these.
    Container(Vec<Container>),
    /// The task's source track has one of these languages.
    Language(Vec<String>),
    /// For subtitle tasks, the source track codec; for other tasks, any
    /// subtitle track of the source.
    SubtitleCodec(Vec<SubtitleCodec>),
    /// Whether the source carries font attachments.
    HasAttachments(bool),
}

impl Condition {
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> bool {
        match self {
            Condition::TaskType(types) => types.contains(&ctx.job_type()),
            Condition::Container(containers) => containers.contains(&ctx.profile.container.format()),
            Condition::Language(languages) => ctx
                .spec
                .language()
                .is_some_and(|lang| languages.iter().any(|l| l.eq_ignore_ascii_case(lang))),
            Condition::SubtitleCodec(codecs) => match ctx.spec {
                TaskSpec::Subtitle { source_codec, .. } => {
                    source_codec.is_some_and(|c| codecs.contains(&c))
                }
                _ => ctx
                    .media
                    .subtitle_tracks
                    .iter()
                    .filter_map(|t| t.subtitle_codec())
                    .any(|c| codecs.contains(&c)),
            },
            Condition::HasAttachments(expected) => {
                ctx.media.font_attachments().next().is_some() == *expected
            }
        }
    }
}

/// Boolean expression over conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Condition(Condition),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> bool {
        match self {
            Expr::Condition(c) => c.evaluate(ctx),
            Expr::And(exprs) => exprs.iter().all(|e| e.evaluate(ctx)),
            Expr::Or(exprs) => exprs.iter().any(|e| e.evaluate(ctx)),
            Expr::Not(inner) => !inner.evaluate(ctx),
        }
    }

    pub fn task_type(types: impl IntoIterator<Item = JobType>) -> Self {
        Expr::Condition(Condition::TaskType(types.into_iter().collect()))
    }
}

/// A rule: when `expr` matches, run `actions` after the primary transcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher values run first.
    #[serde(default)]
    pub priority: i32,
    /// Absent matches every task.
    #[serde(default)]
    pub expr: Option<Expr>,
    pub actions: Vec<PostActionConfig>,
}

fn default_enabled() -> bool {
    true
}

impl JobRule {
    pub fn matches(&self, ctx: &RuleContext<'_>) -> bool {
        self.enabled && self.expr.as_ref().map_or(true, |e| e.evaluate(ctx))
    }
}

/// Rules a profile implies without any configuration.
pub fn implicit_rules(profile: &EncodingProfile) -> Vec<JobRule> {
    let mut rules: Vec<JobRule> = profile
        .burn_in_subtitles()
        .map(|sub| JobRule {
            name: format!("burn in {} subtitles", sub.codec),
            enabled: true,
            priority: i32::MAX,
            expr: Some(Expr::task_type([JobType::Video])),
            actions: vec![PostActionConfig::BurnInSubtitles {
                languages: sub.languages.clone(),
                include_forced: sub.include_forced,
                required: false,
            }],
        })
        .collect();

    rules.push(JobRule {
        name: "extract fonts for ass subtitles".into(),
        enabled: true,
        priority: i32::MAX,
        expr: Some(Expr::And(vec![
            Expr::task_type([JobType::Subtitle]),
            Expr::Condition(Condition::SubtitleCodec(vec![SubtitleCodec::Ass])),
            Expr::Condition(Condition::HasAttachments(true)),
        ])),
        actions: vec![PostActionConfig::ExtractFonts { required: false }],
    });
    rules
}

/// Configured rules, sorted by priority.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<JobRule>,
}

impl RuleEngine {
    pub fn new(mut rules: Vec<JobRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    /// Load rules from a JSON array. A missing file yields no rules.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let rules: Vec<JobRule> = serde_json::from_str(&text).map_err(|e| {
                    Error::validation(format!("invalid rules file {}: {e}", path.display()))
                })?;
                tracing::info!(path = %path.display(), rules = rules.len(), "Loaded job rules");
                Ok(Self::new(rules))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No rules file");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn rules(&self) -> &[JobRule] {
        &self.rules
    }

    /// Actions for one task, implicit rules first, in rule order.
    pub fn resolve(&self, ctx: &RuleContext<'_>) -> Vec<PostActionConfig> {
        let implicit = implicit_rules(ctx.profile);
        implicit
            .iter()
            .chain(self.rules.iter())
            .filter(|rule| rule.matches(ctx))
            .inspect(|rule| tracing::debug!(rule = %rule.name, "Rule matched"))
            .flat_map(|rule| rule.actions.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_codec::store::builtin_profiles;
    use ef_probe::fixtures;
    use std::time::Duration;

    fn subtitle_spec(codec: SubtitleCodec, lang: &str) -> TaskSpec {
        TaskSpec::Subtitle {
            output: 0,
            stream_index: 5,
            source_codec: Some(codec),
            language: Some(lang.into()),
            forced: false,
            default: false,
        }
    }

    fn video_spec() -> TaskSpec {
        TaskSpec::Video {
            output: 0,
            segment: None,
        }
    }

    #[test]
    fn conditions() {
        let profile = &builtin_profiles()[0];
        let media = fixtures::multi_track(Duration::from_secs(60));
        let spec = subtitle_spec(SubtitleCodec::Ass, "eng");
        let ctx = RuleContext {
            spec: &spec,
            profile,
            media: &media,
        };
        assert!(Condition::TaskType(vec![JobType::Subtitle]).evaluate(&ctx));
        assert!(Condition::Container(vec![Container::Hls]).evaluate(&ctx));
        assert!(Condition::Language(vec!["ENG".into()]).evaluate(&ctx));
        assert!(!Condition::Language(vec!["ger".into()]).evaluate(&ctx));
        assert!(Condition::SubtitleCodec(vec![SubtitleCodec::Ass]).evaluate(&ctx));
        assert!(Condition::HasAttachments(true).evaluate(&ctx));

        let video = video_spec();
        let vctx = RuleContext { spec: &video, ..ctx };
        // Any source subtitle track counts for non-subtitle tasks.
        assert!(Condition::SubtitleCodec(vec![SubtitleCodec::Pgs]).evaluate(&vctx));
        assert!(!Condition::Language(vec!["eng".into()]).evaluate(&vctx));
    }

    #[test]
    fn expression_combinators() {
        let profile = &builtin_profiles()[0];
        let media = fixtures::sdr_1080p(Duration::from_secs(60));
        let spec = video_spec();
        let ctx = RuleContext {
            spec: &spec,
            profile,
            media: &media,
        };
        let is_video = Expr::task_type([JobType::Video]);
        let has_fonts = Expr::Condition(Condition::HasAttachments(true));
        assert!(Expr::Or(vec![is_video.clone(), has_fonts.clone()]).evaluate(&ctx));
        assert!(!Expr::And(vec![is_video.clone(), has_fonts.clone()]).evaluate(&ctx));
        assert!(Expr::Not(Box::new(has_fonts)).evaluate(&ctx));
        assert!(Expr::And(vec![]).evaluate(&ctx));
    }

    #[test]
    fn implicit_font_rule() {
        let profile = &builtin_profiles()[0];
        let media = fixtures::multi_track(Duration::from_secs(60));
        let engine = RuleEngine::default();

        let ass = subtitle_spec(SubtitleCodec::Ass, "eng");
        let actions = engine.resolve(&RuleContext {
            spec: &ass,
            profile,
            media: &media,
        });
        assert_eq!(actions, vec![PostActionConfig::ExtractFonts { required: false }]);

        let srt = subtitle_spec(SubtitleCodec::Srt, "eng");
        assert!(engine
            .resolve(&RuleContext {
                spec: &srt,
                profile,
                media: &media,
            })
            .is_empty());
    }

    #[test]
    fn implicit_burn_in_rule() {
        let mut profile = builtin_profiles()[2].clone();
        profile.subtitles[0].burn_in = true;
        profile.subtitles[0].languages = vec!["eng".into()];
        let media = fixtures::multi_track(Duration::from_secs(60));
        let spec = video_spec();
        let actions = RuleEngine::default().resolve(&RuleContext {
            spec: &spec,
            profile: &profile,
            media: &media,
        });
        assert!(matches!(
            actions.as_slice(),
            [PostActionConfig::BurnInSubtitles { languages, .. }] if languages == &["eng".to_string()]
        ));
    }

    #[test]
    fn configured_rules_by_priority() {
        let json = r#"[
            {"name": "low", "actions": [{"type": "exec", "program": "true"}]},
            {"name": "english audio only", "priority": 10,
             "expr": {"and": [
                 {"condition": {"type": "task_type", "value": ["master"]}},
                 {"not": {"condition": {"type": "container", "value": ["hls"]}}}
             ]},
             "actions": [{"type": "filter_audio_languages", "languages": ["eng"], "required": true}]},
            {"name": "disabled", "enabled": false, "actions": [{"type": "extract_fonts"}]}
        ]"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, json).unwrap();
        let engine = RuleEngine::load(&path).unwrap();
        assert_eq!(engine.rules()[0].name, "english audio only");

        let profile = &builtin_profiles()[2];
        let media = fixtures::sdr_1080p(Duration::from_secs(60));
        let actions = engine.resolve(&RuleContext {
            spec: &TaskSpec::Master,
            profile,
            media: &media,
        });
        assert_eq!(actions.len(), 2);
        assert!(actions[0].required());
        assert_eq!(actions[1].name(), "exec");
    }

    #[test]
    fn missing_rules_file_is_empty() {
        let engine = RuleEngine::load(Path::new("/nonexistent/rules.json")).unwrap();
        assert!(engine.rules().is_empty());
    }
}
