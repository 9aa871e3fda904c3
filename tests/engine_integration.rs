//! Scenario documents executed end to end against the mock desktop.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use remote_pilot::engine::{AutomationEngine, EngineOptions};
use remote_pilot::remote::{MockDesktop, RemoteCall, RemoteController};
use remote_pilot::script::{Step, load_document, parse_document};
use remote_pilot::status::LogLevel;
use remote_pilot::vlm::ScriptedOracle;

const DOCUMENT: &str = r#"
connection:
  protocol: vnc
  host: 10.0.0.5
  port: 5901
  password: secret
ollama:
  url: http://gpu-box:11434
  model: llava:13b
scenarios:
  missing_element:
    - action: connect
    - action: wait
      seconds: 1
    - action: find_and_click
      element: X
    - action: disconnect
  login:
    - action: connect
    - action: click_position
      position: center
    - action: type
      text: hunter2
    - action: key
      key: enter
    - action: analyze
      question: Which window has focus?
      save_to: focus
    - action: screenshot
      name: after login
    - action: disconnect
"#;

fn engine(desktop: Arc<MockDesktop>, oracle: ScriptedOracle, dir: &std::path::Path) -> AutomationEngine {
    let options = EngineOptions::default()
        .output_dir(dir)
        .settle_delay(Duration::from_millis(10));
    AutomationEngine::new(desktop, Arc::new(oracle), options)
}

#[test]
fn test_document_settings() {
    let doc = parse_document(DOCUMENT).unwrap();
    assert_eq!(doc.connection.target(), "vnc://10.0.0.5:5901");
    assert_eq!(doc.connection.password, "secret");
    assert_eq!(doc.ollama.url, "http://gpu-box:11434");
    assert_eq!(doc.ollama.model, "llava:13b");
    assert_eq!(doc.scenarios.len(), 2);
}

#[test]
fn test_not_found_element_is_a_soft_error() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = parse_document(DOCUMENT).unwrap();
    let desktop = Arc::new(MockDesktop::new(800, 600));
    let oracle = ScriptedOracle::new().reply(r#"{"found": false}"#).reply("NOT-FOUND");
    let engine = engine(desktop.clone(), oracle, tmp.path());

    let report = engine
        .execute(doc.scenario("missing_element").unwrap(), "missing_element")
        .unwrap();

    assert_eq!(report.steps_run, 4);
    assert_eq!(report.errors, vec!["Element not found: X".to_string()]);
    assert_eq!(desktop.actions(), vec![RemoteCall::Connect, RemoteCall::Disconnect]);
    assert!(!desktop.is_connected());

    let snapshot = engine.status().snapshot();
    assert!(!snapshot.is_executing && !snapshot.connected);
    assert_eq!((snapshot.current_step, snapshot.total_steps), (4, 4));
    let messages: Vec<&str> = snapshot.recent_logs.iter().map(|e| e.message.as_str()).collect();
    assert!(messages.contains(&"Step 3: find_and_click"), "{messages:?}");
    assert!(
        snapshot
            .recent_logs
            .iter()
            .any(|e| e.level == LogLevel::Error && e.message == "Element not found: X")
    );
}

#[test]
fn test_login_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = parse_document(DOCUMENT).unwrap();
    let desktop = Arc::new(MockDesktop::with_color(1024, 768, [20, 20, 20]));
    let oracle = Arc::new(ScriptedOracle::new().reply("The terminal window"));
    let options = EngineOptions::default()
        .output_dir(tmp.path())
        .settle_delay(Duration::ZERO);
    let engine = AutomationEngine::new(desktop.clone(), oracle.clone(), options);

    let report = engine.execute(doc.scenario("login").unwrap(), "login").unwrap();

    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.variables.get("focus").map(String::as_str), Some("The terminal window"));
    assert_eq!(oracle.prompts(), vec!["Which window has focus?".to_string()]);
    assert_eq!(
        desktop.actions(),
        vec![
            RemoteCall::Connect,
            RemoteCall::Click { x: 512, y: 384 },
            RemoteCall::Type("hunter2".to_string()),
            RemoteCall::Key(remote_pilot::remote::Key::Enter),
            RemoteCall::Disconnect,
        ]
    );

    let shots: Vec<_> = fs::read_dir(tmp.path().join("screenshots"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(shots.len(), 1);
    assert!(shots[0].ends_with("_006_after_login.png"), "{}", shots[0]);

    // Latest frame is available for live preview
    assert!(engine.status().latest_frame_png().is_some());
}

#[test]
fn test_repeated_runs_produce_the_same_actions() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = parse_document(DOCUMENT).unwrap();
    let steps = doc.scenario("login").unwrap();

    let mut sequences = Vec::new();
    for _ in 0..2 {
        let desktop = Arc::new(MockDesktop::new(640, 480));
        let engine = engine(desktop.clone(), ScriptedOracle::new().reply("x"), tmp.path());
        engine.execute(steps, "login").unwrap();
        sequences.push(desktop.actions());
    }
    assert_eq!(sequences[0], sequences[1]);
}

#[test]
fn test_load_document_from_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("scenarios.yaml");
    fs::write(&path, DOCUMENT).unwrap();

    let doc = load_document(&path).unwrap();
    assert_eq!(doc.scenario("login").unwrap().first(), Some(&Step::Connect));

    let missing = load_document(&tmp.path().join("nope.yaml")).unwrap_err();
    assert!(missing.to_string().contains("nope.yaml"));
}

#[test]
fn test_invalid_step_fails_at_load_time() {
    let broken = "scenarios:\n  s:\n    - action: click\n      x: 10\n";
    let err = parse_document(broken).unwrap_err();
    assert!(err.to_string().contains("invalid `click` step"), "{err}");
}
