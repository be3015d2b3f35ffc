use crate::cache::{CacheStore, MessageFilter};
use crate::error::{RuleError, ServiceError, StoreError};
use crate::models::{extract_address, MessageRecord, RuleDef, SmartFolderRecord};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

// --- Compiled types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleField {
    Subject,
    From,
    To,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOperator {
    Contains,
    Equals,
    StartsWith,
    EndsWith,
}

/// A checked rule. Values are normalised (trimmed, lower-cased) once here
/// so evaluation only compares.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRule {
    pub field: RuleField,
    pub operator: RuleOperator,
    pub value: String,
}

impl RuleField {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "subject" => Some(RuleField::Subject),
            "from" => Some(RuleField::From),
            "to" => Some(RuleField::To),
            "body" => Some(RuleField::Body),
            _ => None,
        }
    }
}

impl RuleOperator {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "contains" => Some(RuleOperator::Contains),
            "equals" => Some(RuleOperator::Equals),
            "startswith" => Some(RuleOperator::StartsWith),
            "endswith" => Some(RuleOperator::EndsWith),
            _ => None,
        }
    }

    fn test(self, haystack: &str, needle: &str) -> bool {
        match self {
            RuleOperator::Contains => haystack.contains(needle),
            RuleOperator::Equals => haystack == needle,
            RuleOperator::StartsWith => haystack.starts_with(needle),
            RuleOperator::EndsWith => haystack.ends_with(needle),
        }
    }
}

// --- Compilation ---

pub fn compile_rule(index: usize, def: &RuleDef) -> Result<FilterRule, RuleError> {
    let field = RuleField::parse(&def.field).ok_or_else(|| RuleError::UnknownField {
        index,
        field: def.field.clone(),
    })?;
    let operator = RuleOperator::parse(&def.operator).ok_or_else(|| RuleError::UnknownOperator {
        index,
        operator: def.operator.clone(),
    })?;
    let value = normalize(&def.value);
    if value.is_empty() {
        return Err(RuleError::EmptyValue { index });
    }
    Ok(FilterRule {
        field,
        operator,
        value,
    })
}

/// Creation-time check: every rule must compile.
pub fn compile_rules(defs: &[RuleDef]) -> Result<Vec<FilterRule>, Vec<RuleError>> {
    if defs.is_empty() {
        return Err(vec![RuleError::NoRules]);
    }
    let mut rules = Vec::with_capacity(defs.len());
    let mut errors = Vec::new();
    for (i, def) in defs.iter().enumerate() {
        match compile_rule(i, def) {
            Ok(rule) => rules.push(rule),
            Err(e) => errors.push(e),
        }
    }
    if errors.is_empty() {
        Ok(rules)
    } else {
        Err(errors)
    }
}

pub fn format_rules_for_display(defs: &[RuleDef]) -> String {
    defs.iter()
        .map(|d| format!("{} {} \"{}\"", d.field, d.operator, d.value))
        .collect::<Vec<_>>()
        .join(" AND ")
}

// --- Evaluation ---

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Candidate values for a field. A rule holds if it holds for any of them.
fn field_values(field: RuleField, msg: &MessageRecord) -> Vec<String> {
    match field {
        RuleField::Subject => vec![normalize(&msg.subject)],
        RuleField::From => vec![normalize(&msg.sender), msg.sender_address()],
        RuleField::To => {
            let mut values: Vec<String> = msg.recipients.iter().map(|r| extract_address(r)).collect();
            values.push(normalize(&msg.recipients.join(", ")));
            values
        }
        RuleField::Body => vec![normalize(&msg.preview)],
    }
}

pub fn evaluate_rule(rule: &FilterRule, msg: &MessageRecord) -> bool {
    field_values(rule.field, msg)
        .iter()
        .any(|v| rule.operator.test(v, &rule.value))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FolderEvaluation {
    pub matches: Vec<String>,
    #[serde(serialize_with = "serialize_errors")]
    pub rule_errors: Vec<RuleError>,
}

fn serialize_errors<S: serde::Serializer>(errors: &[RuleError], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(errors.iter().map(|e| e.to_string()))
}

/// Stored rules are AND-ed. A rule that fails to compile counts as false and
/// is reported; the remaining rules are still checked for diagnostics.
pub fn evaluate_folder<I>(defs: &[RuleDef], messages: I) -> Result<FolderEvaluation, StoreError>
where
    I: IntoIterator<Item = Result<MessageRecord, StoreError>>,
{
    let mut rules = Vec::with_capacity(defs.len());
    let mut rule_errors = Vec::new();
    for (i, def) in defs.iter().enumerate() {
        match compile_rule(i, def) {
            Ok(rule) => rules.push(rule),
            Err(e) => rule_errors.push(e),
        }
    }
    if rules.is_empty() && rule_errors.is_empty() {
        rule_errors.push(RuleError::NoRules);
    }

    let mut matches = Vec::new();
    if rule_errors.is_empty() {
        for msg in messages {
            let msg = msg?;
            if rules.iter().all(|r| evaluate_rule(r, &msg)) {
                matches.push(msg.id);
            }
        }
    }
    Ok(FolderEvaluation {
        matches,
        rule_errors,
    })
}

// --- Engine ---

pub struct SmartFolderRuleEngine {
    store: Arc<CacheStore>,
}

impl SmartFolderRuleEngine {
    pub fn new(store: Arc<CacheStore>) -> Self {
        SmartFolderRuleEngine { store }
    }

    /// Validate and store a smart folder. Re-creating a name replaces its
    /// rules but keeps its creation time.
    pub fn create(
        &self,
        name: &str,
        description: &str,
        rules: Vec<RuleDef>,
        priority: i32,
    ) -> Result<SmartFolderRecord, ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::InvalidInput(
                "smart folder name must not be empty".to_string(),
            ));
        }
        compile_rules(&rules).map_err(ServiceError::Rules)?;

        let record = self.store.write(|txn| {
            let created_at = txn
                .get_smart_folder(name)?
                .map_or(txn.now(), |existing| existing.created_at);
            let record = SmartFolderRecord {
                name: name.to_string(),
                description: description.to_string(),
                rules,
                priority,
                created_at,
                last_applied: None,
                match_count: 0,
                active: true,
            };
            txn.put_smart_folder(&record)?;
            Ok::<_, StoreError>(record)
        })?;
        info!(
            "[Rules] smart folder '{}' saved: {}",
            record.name,
            format_rules_for_display(&record.rules)
        );
        Ok(record)
    }

    /// Evaluate a folder over the messages selected by `scope`. Never
    /// mutates messages.
    pub fn evaluate(
        &self,
        folder: &SmartFolderRecord,
        scope: MessageFilter,
    ) -> Result<FolderEvaluation, StoreError> {
        let eval = evaluate_folder(&folder.rules, self.store.query_messages(scope)?)?;
        for err in &eval.rule_errors {
            warn!("[Rules] smart folder '{}': {}", folder.name, err);
        }
        Ok(eval)
    }

    /// Evaluate and record the run (last applied, match count).
    pub fn apply(&self, name: &str, scope: MessageFilter) -> Result<FolderEvaluation, ServiceError> {
        let folder = self
            .store
            .get_smart_folder(name)?
            .ok_or_else(|| ServiceError::NotFound(format!("smart folder '{}'", name)))?;
        let eval = self.evaluate(&folder, scope)?;
        let count = eval.matches.len();
        self.store.write(|txn| {
            if let Some(mut current) = txn.get_smart_folder(name)? {
                current.last_applied = Some(txn.now());
                current.match_count = count;
                txn.put_smart_folder(&current)?;
            }
            Ok::<_, StoreError>(())
        })?;
        debug!("[Rules] smart folder '{}' matched {} messages", name, count);
        Ok(eval)
    }

    /// Active folders, highest priority first.
    pub fn list(&self) -> Result<Vec<SmartFolderRecord>, StoreError> {
        let now = self.store.now();
        let expiry = *self.store.expiry();
        let mut folders: Vec<SmartFolderRecord> = self
            .store
            .all_smart_folders()?
            .into_iter()
            .filter(|f| !expiry.smart_folder_expired(f, now))
            .collect();
        folders.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(folders)
    }
}
