use assert_cmd::cargo::cargo_bin_cmd;

fn help_text(args: &[&str]) -> String {
    let mut cmd = cargo_bin_cmd!("siftctl");
    let output = cmd
        .args(args)
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8_lossy(&output).into_owned()
}

#[test]
fn top_level_help_lists_commands() {
    let text = help_text(&[]);
    for command in [
        "worker",
        "sweep",
        "start-batch",
        "status",
        "pause",
        "resume",
        "stop",
        "overview",
        "reset",
        "workers",
    ] {
        assert!(text.contains(command), "help missing '{command}'");
    }
}

#[test]
fn sweep_help_mentions_options() {
    let text = help_text(&["sweep"]);
    assert!(text.contains("--force-refresh"), "sweep help missing --force-refresh");
    assert!(text.contains("--auto-continue"), "sweep help missing --auto-continue");
    assert!(text.contains("--entities"), "sweep help missing --entities");
    assert!(text.contains("--drain"), "sweep help missing --drain");
}

#[test]
fn worker_help_mentions_queues() {
    let text = help_text(&["worker"]);
    assert!(text.contains("--queues"), "worker help missing --queues");
}

#[test]
fn workers_subcommands_present() {
    let text = help_text(&["workers"]);
    assert!(text.contains("list"), "workers help missing list");
    assert!(text.contains("start"), "workers help missing start");
    assert!(text.contains("stop"), "workers help missing stop");
}

#[test]
fn malformed_job_id_is_rejected() {
    let mut cmd = cargo_bin_cmd!("siftctl");
    cmd.arg("status").arg("not-a-uuid").assert().failure();
}
