//! Prompt templates keyed by request type.
//!
//! The executor never hard-codes prompt text: it asks the registry for the
//! template of the batch's type and falls back to a generic one. New request
//! types only need a registry entry.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::types::{InferenceRequest, RequestType};

/// Prompt text for one request type
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    /// System prompt passed alongside the combined prompt
    pub system_prompt: String,
    /// Task description placed before the list of items
    pub instructions: String,
}

impl PromptTemplate {
    pub fn new(system_prompt: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self { system_prompt: system_prompt.into(), instructions: instructions.into() }
    }

    /// Build the combined prompt for an ordered batch of requests.
    ///
    /// Every payload is tagged with its position so the response can be
    /// demultiplexed positionally.
    pub fn render(&self, requests: &[InferenceRequest]) -> String {
        let items: Vec<Value> = requests
            .iter()
            .enumerate()
            .map(|(index, request)| json!({ "index": index, "payload": request.payload }))
            .collect();
        let items = serde_json::to_string_pretty(&items).unwrap_or_else(|_| "[]".to_string());
        let n = requests.len();

        format!(
            "{instructions}\n\n\
             Process each of the following {n} items independently. \
             Respond with only a JSON array containing exactly {n} entries in the same order \
             as the items. Each entry must be an object of the form \
             {{\"index\": <item index>, \"result\": <result for that item>}}.\n\n\
             Items:\n{items}",
            instructions = self.instructions,
        )
    }
}

/// Lookup table of templates with a generic fallback
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<RequestType, PromptTemplate>,
    fallback: PromptTemplate,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateRegistry {
    /// Registry with only the generic fallback
    pub fn empty() -> Self {
        Self { templates: HashMap::new(), fallback: generic_template() }
    }

    /// Registry with templates for the built-in request types
    pub fn builtin() -> Self {
        const SYSTEM: &str = "You are a clinical decision support assistant. \
            Answer strictly in JSON. Never invent patient data that is not in the input.";

        let mut registry = Self::empty();
        registry
            .register(
                RequestType::RISK_SCORING,
                PromptTemplate::new(
                    SYSTEM,
                    "For each patient record, estimate a clinical risk score between 0 and 100 \
                     with the top contributing factors.",
                ),
            )
            .register(
                RequestType::BILLING_CODES,
                PromptTemplate::new(
                    SYSTEM,
                    "For each encounter note, suggest the most specific ICD-10 and CPT codes \
                     with a confidence between 0 and 1 and a short rationale.",
                ),
            )
            .register(
                RequestType::SDOH_DETECTION,
                PromptTemplate::new(
                    SYSTEM,
                    "For each note, list social determinants of health that are present \
                     (housing, food, transportation, financial, social isolation) with evidence.",
                ),
            )
            .register(
                RequestType::CARE_PLAN,
                PromptTemplate::new(
                    SYSTEM,
                    "For each patient summary, draft care plan goals and interventions.",
                ),
            )
            .register(
                RequestType::SCREENING,
                PromptTemplate::new(
                    SYSTEM,
                    "For each screening response set, compute the instrument score and \
                     severity band and flag items that need follow-up.",
                ),
            )
            .register(
                RequestType::READMISSION_RISK,
                PromptTemplate::new(
                    SYSTEM,
                    "For each discharge summary, estimate 30-day readmission risk as low, \
                     moderate or high with the main drivers.",
                ),
            )
            .register(
                RequestType::MEDICATION_REVIEW,
                PromptTemplate::new(
                    SYSTEM,
                    "For each medication list, identify interactions, duplications and \
                     dosing concerns.",
                ),
            )
            .register(
                RequestType::CLINICAL_SUMMARY,
                PromptTemplate::new(SYSTEM, "Summarise each clinical document in at most five sentences."),
            );
        registry
    }

    /// Add or replace the template for a type
    pub fn register(&mut self, request_type: RequestType, template: PromptTemplate) -> &mut Self {
        self.templates.insert(request_type, template);
        self
    }

    pub fn with_fallback(mut self, fallback: PromptTemplate) -> Self {
        self.fallback = fallback;
        self
    }

    /// Template for a type, or the generic fallback
    pub fn get(&self, request_type: &RequestType) -> &PromptTemplate {
        self.templates.get(request_type).unwrap_or(&self.fallback)
    }

    pub fn contains(&self, request_type: &RequestType) -> bool {
        self.templates.contains_key(request_type)
    }
}

fn generic_template() -> PromptTemplate {
    PromptTemplate::new(
        "You are a helpful assistant. Answer strictly in JSON.",
        "Complete the task described by each item's payload.",
    )
}
