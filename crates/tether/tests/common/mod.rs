//! Test utilities: fake agent scripts and service setup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use tether::service::TetherService;
use tether::settings::Settings;

/// Write an executable shell script that stands in for the agent CLI.
pub fn write_agent_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-agent.sh");
    fs::write(&path, format!("#!/bin/bash\n{body}\n")).unwrap();
    #[cfg(unix)]
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Build a service whose agent binary is the given script, plus a project
/// directory under the workspace root for turns to run in.
pub fn service_with_agent(root: &Path, script_body: &str) -> (Arc<TetherService>, PathBuf) {
    let script = write_agent_script(root, script_body);
    let project = root.join("proj");
    fs::create_dir_all(&project).unwrap();

    let mut settings = Settings::test_defaults(root);
    settings.agent.binary = script;
    (TetherService::new(settings), project)
}

/// Extract the payload `type` tag of an event.
pub fn payload_type(event: &tether_protocol::events::SessionEvent) -> String {
    serde_json::to_value(&event.payload).unwrap()["type"]
        .as_str()
        .unwrap()
        .to_string()
}
