use crate::backend::WorkerHandle;
use crate::cache::MessageFilter;
use crate::error::ServiceError;
use crate::ingest::RawMessage;
use crate::models::RuleDef;
use crate::service::{BatchAction, BatchCriteria, MailCache};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use tracing::debug;

struct CliState<'a> {
    service: &'a MailCache,
    worker: Option<&'a WorkerHandle>,
    shutdown: bool,
}

fn ok_response(data: Value) -> Value {
    let mut obj = match data {
        Value::Object(m) => m,
        _ => {
            let mut m = serde_json::Map::new();
            m.insert("data".to_string(), data);
            m
        }
    };
    obj.insert("ok".to_string(), Value::Bool(true));
    Value::Object(obj)
}

fn err_response(msg: &str) -> Value {
    json!({"ok": false, "error": msg})
}

fn service_error(err: ServiceError) -> Value {
    let kind = match &err {
        ServiceError::Store(_) => "store",
        ServiceError::Rules(_) => "invalid_rules",
        ServiceError::NotFound(_) => "not_found",
        ServiceError::InvalidInput(_) => "invalid_input",
    };
    let mut resp = json!({"ok": false, "error": err.to_string(), "kind": kind});
    if let ServiceError::Rules(errors) = &err {
        resp["rule_errors"] = errors.iter().map(|e| Value::String(e.to_string())).collect();
    }
    resp
}

fn respond<T: Serialize>(result: Result<T, ServiceError>) -> Value {
    match result {
        Ok(data) => match serde_json::to_value(data) {
            Ok(v) => ok_response(v),
            Err(e) => err_response(&format!("failed to encode response: {}", e)),
        },
        Err(e) => service_error(e),
    }
}

/// Deserialize an optional field; absent or null gives the default.
fn field<T: DeserializeOwned + Default>(input: &Value, name: &str) -> Result<T, Value> {
    match input.get(name) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| err_response(&format!("invalid '{}' field: {}", name, e))),
    }
}

fn required<T: DeserializeOwned>(input: &Value, name: &str) -> Result<T, Value> {
    match input.get(name) {
        None | Some(Value::Null) => Err(err_response(&format!("missing '{}' field", name))),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| err_response(&format!("invalid '{}' field: {}", name, e))),
    }
}

fn str_field<'v>(input: &'v Value, name: &str) -> Option<&'v str> {
    input.get(name).and_then(|v| v.as_str())
}

fn dispatch(state: &mut CliState, input: &Value) -> Value {
    let command = match input.get("command").and_then(|v| v.as_str()) {
        Some(c) => c,
        None => return err_response("missing 'command' field"),
    };
    debug!("[CLI] {}", command);

    let result = match command {
        "status" => Ok(cmd_status(state)),
        "list_messages" => cmd_list_messages(state, input),
        "search_messages" => cmd_search_messages(state, input),
        "get_message" => cmd_get_message(state, input),
        "get_thread" => cmd_get_thread(state, input),
        "create_smart_folder" => cmd_create_smart_folder(state, input),
        "apply_smart_folder" => cmd_apply_smart_folder(state, input),
        "list_smart_folders" => Ok(respond(state.service.list_smart_folders().map(
            |folders| json!({"smart_folders": folders}),
        ))),
        "batch_process" => cmd_batch_process(state, input),
        "folder_summary" => Ok(respond(
            state.service.folder_summary(str_field(input, "folder")),
        )),
        "find_duplicates" => Ok(respond(
            state
                .service
                .find_duplicates(str_field(input, "folder"))
                .map(|groups| json!({"groups": groups})),
        )),
        "ingest" => cmd_ingest(state, input),
        "processing_state" => Ok(respond(
            state
                .service
                .processing_state(str_field(input, "folder"))
                .map(|folders| json!({"folders": folders})),
        )),
        "purge_folder" => cmd_purge_folder(state, input),
        "invalidate_analysis" => cmd_invalidate_analysis(state, input),
        "sync_now" => Ok(cmd_sync_now(state)),
        "sweep" => Ok(cmd_sweep(state)),
        "shutdown" => {
            state.shutdown = true;
            Ok(ok_response(json!({"shutting_down": true})))
        }
        _ => Err(err_response(&format!("unknown command '{}'", command))),
    };
    result.unwrap_or_else(|resp| resp)
}

// --- Command handlers ---

fn cmd_status(state: &CliState) -> Value {
    respond(state.service.status())
}

fn cmd_list_messages(state: &CliState, input: &Value) -> Result<Value, Value> {
    let filter: MessageFilter = field(input, "filter")?;
    Ok(respond(
        state
            .service
            .list_messages(filter)
            .map(|messages| json!({"count": messages.len(), "messages": messages})),
    ))
}

fn cmd_search_messages(state: &CliState, input: &Value) -> Result<Value, Value> {
    let query: String = required(input, "query")?;
    let limit: Option<usize> = field(input, "limit")?;
    Ok(respond(
        state
            .service
            .search_messages(&query, str_field(input, "folder"), limit)
            .map(|messages| json!({"count": messages.len(), "messages": messages})),
    ))
}

fn cmd_get_message(state: &CliState, input: &Value) -> Result<Value, Value> {
    let id: String = required(input, "id")?;
    Ok(respond(state.service.get_message(&id)))
}

fn cmd_get_thread(state: &CliState, input: &Value) -> Result<Value, Value> {
    let id = str_field(input, "thread_id")
        .or_else(|| str_field(input, "id"))
        .ok_or_else(|| err_response("missing 'thread_id' field"))?;
    Ok(respond(state.service.get_thread(id)))
}

fn cmd_create_smart_folder(state: &CliState, input: &Value) -> Result<Value, Value> {
    let name: String = required(input, "name")?;
    let rules: Vec<RuleDef> = required(input, "rules")?;
    let description: String = field(input, "description")?;
    let priority: i32 = field(input, "priority")?;
    Ok(respond(state.service.create_smart_folder(
        &name,
        &description,
        rules,
        priority,
    )))
}

fn cmd_apply_smart_folder(state: &CliState, input: &Value) -> Result<Value, Value> {
    let name: String = required(input, "name")?;
    let scope: MessageFilter = field(input, "scope")?;
    Ok(respond(state.service.apply_smart_folder(&name, scope)))
}

fn cmd_batch_process(state: &CliState, input: &Value) -> Result<Value, Value> {
    let criteria: BatchCriteria = required(input, "criteria")?;
    let action: BatchAction = required(input, "action")?;
    Ok(respond(state.service.batch_process(&criteria, action)))
}

fn cmd_ingest(state: &CliState, input: &Value) -> Result<Value, Value> {
    let folder: String = required(input, "folder")?;
    let messages: Vec<RawMessage> = required(input, "messages")?;
    let sync_token = str_field(input, "sync_token").map(str::to_string);
    Ok(respond(state.service.ingest(&folder, messages, sync_token)))
}

fn cmd_purge_folder(state: &CliState, input: &Value) -> Result<Value, Value> {
    let folder: String = required(input, "folder")?;
    Ok(respond(
        state
            .service
            .purge_folder(&folder)
            .map(|removed| json!({"folder": folder, "removed": removed})),
    ))
}

fn cmd_invalidate_analysis(state: &CliState, input: &Value) -> Result<Value, Value> {
    let ids: Option<Vec<String>> = field(input, "ids")?;
    Ok(respond(
        state
            .service
            .invalidate_analysis(ids.as_deref())
            .map(|cleared| json!({"cleared": cleared})),
    ))
}

fn cmd_sync_now(state: &CliState) -> Value {
    let worker = match state.worker {
        Some(w) => w,
        None => return err_response("remote sync is not running"),
    };
    match worker.sync_now() {
        Ok(outcome) => match serde_json::to_value(outcome) {
            Ok(v) => ok_response(v),
            Err(e) => err_response(&format!("failed to encode response: {}", e)),
        },
        Err(e) => err_response(&e),
    }
}

fn cmd_sweep(state: &CliState) -> Value {
    let worker = match state.worker {
        Some(w) => w,
        None => return err_response("background worker is not running"),
    };
    match worker.sweep_now() {
        Ok(report) => match serde_json::to_value(report) {
            Ok(v) => ok_response(v),
            Err(e) => err_response(&format!("failed to encode response: {}", e)),
        },
        Err(e) => err_response(&e),
    }
}

/// Serve NDJSON requests from stdin until EOF or a `shutdown` command.
pub fn run_cli(service: &MailCache, worker: Option<&WorkerHandle>) {
    let mut state = CliState {
        service,
        worker,
        shutdown: false,
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(trimmed) {
            Ok(input) => dispatch(&mut state, &input),
            Err(e) => err_response(&format!("JSON parse error: {}", e)),
        };
        let _ = serde_json::to_writer(&mut stdout, &response);
        let _ = stdout.write_all(b"\n");
        let _ = stdout.flush();

        if state.shutdown {
            break;
        }
    }
}

pub fn print_help_cli() {
    print!(
        r#"mailcache --cli: JSON-over-stdin/stdout CLI mode
===============================================

Protocol: Newline-Delimited JSON (NDJSON)
- Send one JSON object per line to stdin
- Receive one JSON response per line from stdout
- Responses have {{"ok": true, ...}} on success or {{"ok": false, "error": "...", "kind": "..."}} on failure
- Logs go to stderr (filter with MAILCACHE_LOG, e.g. MAILCACHE_LOG=debug)

Message Commands
----------------
list_messages: Newest first; filter fields are all optional.
   > {{"command": "list_messages", "filter": {{"folder": "INBOX", "sender": "boss", "label": "\\Seen",
       "since": "2025-01-01T00:00:00Z", "until": null, "order": "descending", "limit": 50}}}}
   < {{"ok": true, "count": 2, "messages": [{{"id": "...", "thread_id": "...", "importance": 0.42, ...}}]}}

search_messages: Substring match on subject, sender and preview.
   > {{"command": "search_messages", "query": "invoice", "folder": "INBOX", "limit": 20}}

get_message:
   > {{"command": "get_message", "id": "msg-id"}}

get_thread: By thread id or the id of any message in it.
   > {{"command": "get_thread", "thread_id": "msg-id"}}
   < {{"ok": true, "thread": {{"thread_id": "...", "message_count": 3, "participants": [...], ...}}, "messages": [...]}}

Smart Folders
-------------
create_smart_folder: Rules are AND-ed. Fields: subject, from, to, body.
   Operators: contains, equals, startswith, endswith.
   > {{"command": "create_smart_folder", "name": "boss", "description": "", "priority": 10,
       "rules": [{{"field": "from", "operator": "contains", "value": "boss@x.com"}}]}}
   Invalid rules fail with "kind": "invalid_rules" and a "rule_errors" list.

apply_smart_folder: Returns matching ids; never modifies messages.
   > {{"command": "apply_smart_folder", "name": "boss", "scope": {{"folder": "INBOX"}}}}
   < {{"ok": true, "matches": ["id1", "id2"], "rule_errors": []}}

list_smart_folders:
   > {{"command": "list_smart_folders"}}

Bulk and Analysis
-----------------
batch_process: Applies the action locally and returns the ids for the mail server.
   Criteria: folder, sender, subject, date_from, date_to, label (at least one).
   Actions: {{"type": "move", "folder": "..."}}, {{"type": "delete"}}, {{"type": "label", "label": "..."}},
            {{"type": "mark_read"}}, {{"type": "mark_unread"}}
   > {{"command": "batch_process", "criteria": {{"sender": "news@"}}, "action": {{"type": "mark_read"}}}}
   < {{"ok": true, "action": {{"type": "mark_read"}}, "message_ids": [...], "changed": 4}}

folder_summary: Counts, top senders/domains, categories, threads, duplicates.
   > {{"command": "folder_summary", "folder": "INBOX"}}

find_duplicates:
   > {{"command": "find_duplicates", "folder": "INBOX"}}
   < {{"ok": true, "groups": [{{"fingerprint": "...", "folder": "INBOX", "message_ids": ["newest", "older"]}}]}}

Ingestion and Maintenance
-------------------------
ingest: Store one fetched batch (threads, scores and categories are computed).
   Optional "sync_token" is saved on the folder cursor. A folder with no cursor needs a full fetch.
   > {{"command": "ingest", "folder": "INBOX", "messages": [{{"id": "m1", "subject": "...", "from": "a@b.c",
       "to": ["me@x.com"], "date": "2025-06-01T10:00:00Z", "references": [], "text_body": "..."}}]}}

processing_state: Per-folder fetch cursors.
   > {{"command": "processing_state", "folder": "INBOX"}}

purge_folder: Drop everything cached for a folder.
   > {{"command": "purge_folder", "folder": "Old"}}

invalidate_analysis: Clear scores and categories (all, or the given ids).
   > {{"command": "invalidate_analysis", "ids": ["m1"]}}

Process Commands
----------------
status:    {{"command": "status"}}     store counts, cursors and remote sync health
sync_now:  {{"command": "sync_now"}}   run a lease-guarded sync cycle now
sweep:     {{"command": "sweep"}}      remove expired messages, threads and smart folders now
shutdown:  {{"command": "shutdown"}}   final upload, release lease, exit
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_helpers() {
        let input = json!({"name": "x", "limit": 5, "bad": "nope"});
        assert_eq!(required::<String>(&input, "name").unwrap(), "x");
        assert!(required::<String>(&input, "missing").is_err());
        assert_eq!(field::<Option<usize>>(&input, "limit").unwrap(), Some(5));
        assert_eq!(field::<Option<usize>>(&input, "absent").unwrap(), None);
        assert!(field::<usize>(&input, "bad").is_err());
    }

    #[test]
    fn test_service_error_kinds() {
        let resp = service_error(ServiceError::NotFound("message 'x'".into()));
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["kind"], "not_found");
        let resp = service_error(ServiceError::Rules(vec![crate::error::RuleError::NoRules]));
        assert_eq!(resp["kind"], "invalid_rules");
        assert_eq!(resp["rule_errors"].as_array().unwrap().len(), 1);
    }
}
