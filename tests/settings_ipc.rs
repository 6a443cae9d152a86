mod test_support;

use serde_json::json;
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_dir};

#[test]
fn settings_update_persists_across_workspace_reopen() {
    let workspace = temp_dir("timetabled-settings");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "2", "settings.get", json!({}));
    assert_eq!(defaults["settings"]["subject"], json!("english"));
    assert_eq!(defaults["settings"]["maxBatchWrites"], json!(450));
    assert_eq!(defaults["settings"]["backupBeforeApply"], json!(true));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "settings.update",
        json!({ "patch": { "subject": "math", "maxBatchWrites": 200 } }),
    );
    assert_eq!(updated["settings"]["subject"], json!("math"));

    let rejected = request(
        &mut stdin,
        &mut reader,
        "4",
        "settings.update",
        json!({ "patch": { "subject": "science", "colour": "red" } }),
    );
    assert_eq!(error_code(&rejected), Some("bad_params"));
    let _ = child.kill();

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let reopened = request_ok(&mut stdin, &mut reader, "2", "settings.get", json!({}));
    assert_eq!(reopened["settings"]["subject"], json!("math"));
    assert_eq!(reopened["settings"]["maxBatchWrites"], json!(200));
    let health = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert_eq!(health["subject"], json!("math"));
    let _ = child.kill();
}
