//! The closed set of mutation templates used to evolve instructions.

use serde_json::json;

/// Placeholder substituted with the instruction being evolved.
const PROMPT_SLOT: &str = "<PROMPT>";

/// Prompt used to synthesize seed instructions when none are supplied.
pub const SEED_INSTRUCTION_PROMPT: &str = "Write one self-contained instruction that a curious \
user might give an AI assistant. Reply with the instruction only, without any preamble.";

// ---------------------------------------------------------------------------
// MutationTemplate
// ---------------------------------------------------------------------------

/// A named, fixed prompt template that rewrites an instruction. Selection
/// among the set is randomized but reproducible under a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationTemplate {
    FreshStart,
    AddConstraints,
    Deepen,
    Concretize,
    IncreaseReasoning,
    SwitchTopic,
}

impl MutationTemplate {
    /// Every member, in declaration order. This order is what the seeded
    /// selection indexes into.
    pub fn all() -> &'static [MutationTemplate] {
        &[
            MutationTemplate::FreshStart,
            MutationTemplate::AddConstraints,
            MutationTemplate::Deepen,
            MutationTemplate::Concretize,
            MutationTemplate::IncreaseReasoning,
            MutationTemplate::SwitchTopic,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            MutationTemplate::FreshStart => "FRESH_START",
            MutationTemplate::AddConstraints => "ADD_CONSTRAINTS",
            MutationTemplate::Deepen => "DEEPEN",
            MutationTemplate::Concretize => "CONCRETIZE",
            MutationTemplate::IncreaseReasoning => "INCREASE_REASONING",
            MutationTemplate::SwitchTopic => "SWITCH_TOPIC",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.name() == name)
    }

    pub fn template(&self) -> &'static str {
        match self {
            MutationTemplate::FreshStart => {
                "I want you to act as a Prompt Creator.\n\
                 Take #Given Prompt# as inspiration and write one brand-new prompt on the same \
                 topic, approached from a fresh angle.\n\
                 The #Created Prompt# must be reasonable, understandable, and answerable by a human.\n\
                 Reply with the created prompt only.\n\n\
                 #Given Prompt#:\n<PROMPT>\n\n#Created Prompt#:\n"
            }
            MutationTemplate::AddConstraints => {
                "I want you to act as a Prompt Rewriter.\n\
                 Rewrite #Given Prompt# into a more complex version by adding one more \
                 constraint or requirement.\n\
                 The #Rewritten Prompt# must stay reasonable and must not become verbose; add at \
                 most 20 words.\n\
                 Reply with the rewritten prompt only.\n\n\
                 #Given Prompt#:\n<PROMPT>\n\n#Rewritten Prompt#:\n"
            }
            MutationTemplate::Deepen => {
                "I want you to act as a Prompt Rewriter.\n\
                 Rewrite #Given Prompt# into a more complex version by slightly increasing the \
                 depth and breadth of what it asks.\n\
                 The #Rewritten Prompt# must stay reasonable and must not become verbose; add at \
                 most 20 words.\n\
                 Reply with the rewritten prompt only.\n\n\
                 #Given Prompt#:\n<PROMPT>\n\n#Rewritten Prompt#:\n"
            }
            MutationTemplate::Concretize => {
                "I want you to act as a Prompt Rewriter.\n\
                 Rewrite #Given Prompt# into a more complex version by replacing general \
                 concepts with more specific ones.\n\
                 The #Rewritten Prompt# must stay reasonable and must not become verbose; add at \
                 most 20 words.\n\
                 Reply with the rewritten prompt only.\n\n\
                 #Given Prompt#:\n<PROMPT>\n\n#Rewritten Prompt#:\n"
            }
            MutationTemplate::IncreaseReasoning => {
                "I want you to act as a Prompt Rewriter.\n\
                 Rewrite #Given Prompt# so that, if it can be solved in only a few simple \
                 thinking steps, it explicitly requests multiple-step reasoning.\n\
                 The #Rewritten Prompt# must stay reasonable and must not become verbose; add at \
                 most 20 words.\n\
                 Reply with the rewritten prompt only.\n\n\
                 #Given Prompt#:\n<PROMPT>\n\n#Rewritten Prompt#:\n"
            }
            MutationTemplate::SwitchTopic => {
                "I want you to act as a Prompt Creator.\n\
                 Write one brand-new prompt with the same difficulty and format as #Given \
                 Prompt#, but in a completely different domain.\n\
                 The #Created Prompt# must be reasonable, understandable, and answerable by a human.\n\
                 Reply with the created prompt only.\n\n\
                 #Given Prompt#:\n<PROMPT>\n\n#Created Prompt#:\n"
            }
        }
    }

    /// Substitute the instruction into this template's prompt slot.
    pub fn render(&self, instruction: &str) -> String {
        self.template().replace(PROMPT_SLOT, instruction)
    }
}

// ---------------------------------------------------------------------------
// Descriptor form
// ---------------------------------------------------------------------------

/// Serialize a template set as an enumerated-set descriptor:
/// `{"_type": "enum", "_name": ..., "_values": {member: template}}`.
pub fn dump_templates(templates: &[MutationTemplate]) -> serde_json::Value {
    let values: serde_json::Map<String, serde_json::Value> = templates
        .iter()
        .map(|t| (t.name().to_string(), json!(t.template())))
        .collect();
    json!({
        "_type": "enum",
        "_name": "MutationTemplate",
        "_values": values,
    })
}

/// Reconstruct a template set from its enumerated-set descriptor.
pub fn load_templates(descriptor: &serde_json::Value) -> loomgen_types::Result<Vec<MutationTemplate>> {
    let values = descriptor["_values"].as_object().ok_or_else(|| {
        loomgen_types::LoomError::Other(
            "mutation_templates descriptor is missing '_values'".into(),
        )
    })?;
    let mut templates = Vec::with_capacity(values.len());
    for member in values.keys() {
        let template = MutationTemplate::from_name(member).ok_or_else(|| {
            loomgen_types::LoomError::Other(format!(
                "unknown mutation template member '{member}'"
            ))
        })?;
        templates.push(template);
    }
    Ok(templates)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_instruction() {
        let rendered = MutationTemplate::AddConstraints.render("Write a haiku.");
        assert!(rendered.contains("Write a haiku."));
        assert!(!rendered.contains(PROMPT_SLOT));
    }

    #[test]
    fn all_members_have_distinct_names() {
        let names: Vec<_> = MutationTemplate::all().iter().map(|t| t.name()).collect();
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), names.len());
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn from_name_round_trips() {
        for template in MutationTemplate::all() {
            assert_eq!(MutationTemplate::from_name(template.name()), Some(*template));
        }
        assert_eq!(MutationTemplate::from_name("BOGUS"), None);
    }

    #[test]
    fn dump_shape_matches_enum_descriptor_format() {
        let dumped = dump_templates(MutationTemplate::all());
        assert_eq!(dumped["_type"], "enum");
        assert_eq!(dumped["_name"], "MutationTemplate");
        let values = dumped["_values"].as_object().unwrap();
        assert_eq!(values.len(), 6);
        assert!(values["DEEPEN"]
            .as_str()
            .unwrap()
            .contains("depth and breadth"));
    }

    #[test]
    fn load_templates_round_trips() {
        let dumped = dump_templates(MutationTemplate::all());
        let loaded = load_templates(&dumped).unwrap();
        assert_eq!(loaded.len(), 6);
        for template in MutationTemplate::all() {
            assert!(loaded.contains(template));
        }
    }

    #[test]
    fn load_templates_rejects_unknown_member() {
        let descriptor = json!({
            "_type": "enum",
            "_name": "MutationTemplate",
            "_values": { "NOT_A_MEMBER": "text" },
        });
        assert!(load_templates(&descriptor).is_err());
    }
}
