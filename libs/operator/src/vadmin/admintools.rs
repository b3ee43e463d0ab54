//! Legacy back-end: `admintools -t <action>` executed in the server
//! container, textual output parsed with a small family of regexes.

use super::{
    ClusterTarget, CreateDbArgs, NodeState, PodRef, ReplicateDbArgs, RestorePoint,
    DEFAULT_ADMIN_TIMEOUT, SERVER_CONTAINER,
};

use vertiop_k8s_util::error::{Error, Result};
use vertiop_k8s_util::exec::{ExecOutput, PodRunner};

use std::sync::LazyLock;

use regex::Regex;
use tokio::time::Duration;

const ADMINTOOLS: &str = "/opt/vertica/bin/admintools";

static ALREADY_DONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(already exists|is already running|already part of the database|not part of the database|already sandboxed|already a member of sandbox|not sandboxed)",
    )
    .unwrap()
});

static RETRYABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(could not connect to spread|spread is not running|cluster has not converged|temporarily unavailable|connection refused|timed out waiting)",
    )
    .unwrap()
});

// e.g. " v_vertdb_node0001 | 10.244.1.17 | UP | vertica-24.3.0 | /data"
static NODE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?P<name>v_\w+_node\d{4})\s*\|\s*(?P<host>[0-9a-zA-Z_.:-]+)\s*\|\s*(?P<state>[A-Z_]+)\s*\|\s*(?P<version>[^|\s]+)?",
    )
    .unwrap()
});

// e.g. "   1 | sp_20240710 | archive_a | 2024-07-10 12:01:44"
static RESTORE_POINT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?P<index>\d+)\s*\|\s*(?P<id>[\w.-]+)\s*\|\s*(?P<archive>[\w.-]+)\s*\|\s*(?P<ts>[0-9: -]+[0-9])",
    )
    .unwrap()
});

// e.g. "Restore point saved: sp_20240710"
static SAVED_RESTORE_POINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Restore point saved:\s*(?P<id>[\w.-]+)").unwrap());

pub fn is_already_done(output: &str) -> bool {
    ALREADY_DONE_RE.is_match(output)
}

pub fn is_retryable(output: &str) -> bool {
    RETRYABLE_RE.is_match(output)
}

/// Map an exec failure of an admintools invocation into the admin failure
/// taxonomy. Exit-code failures carry the tool's stderr; everything in it is
/// free-form text.
fn classify(action: &str, err: Error) -> Error {
    match err {
        Error::CommandFailed { stderr, .. } => {
            if is_retryable(&stderr) {
                Error::AdminRetryable(action.to_string(), stderr)
            } else {
                Error::AdminFatal(action.to_string(), stderr)
            }
        }
        other => other,
    }
}

async fn run(
    runner: &PodRunner,
    action: &str,
    pod: &PodRef,
    argv: Vec<String>,
    timeout: Duration,
) -> Result<ExecOutput> {
    runner
        .exec(
            &pod.namespace,
            &pod.name,
            SERVER_CONTAINER,
            &argv,
            None,
            timeout,
        )
        .await
        .map_err(|e| classify(action, e))
}

fn argv(tool: &str, args: &[(&str, &str)], flags: &[&str]) -> Vec<String> {
    let mut v = vec![ADMINTOOLS.to_string(), "-t".to_string(), tool.to_string()];
    for (key, value) in args {
        v.push(key.to_string());
        v.push(value.to_string());
    }
    for flag in flags {
        v.push(flag.to_string());
    }
    v
}

fn hosts(pods: &[PodRef]) -> String {
    pods.iter()
        .map(|p| p.dns_name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

pub async fn create_db(runner: &PodRunner, args: &CreateDbArgs<'_>) -> Result<()> {
    let host_list = hosts(args.pods);
    let mut flags = vec!["--force-cleanup-on-failure"];
    if args.skip_package_install {
        flags.push("--skip-package-install");
    }
    let argv = argv(
        "create_db",
        &[
            ("-d", args.db_name),
            ("-s", &host_list),
            ("--communal-storage-location", args.communal_path),
        ],
        &flags,
    );
    run(runner, "create_db", &args.pods[0], argv, args.timeout).await?;
    Ok(())
}

pub async fn revive_db(runner: &PodRunner, args: &CreateDbArgs<'_>) -> Result<()> {
    let host_list = hosts(args.pods);
    let argv = argv(
        "revive_db",
        &[
            ("-d", args.db_name),
            ("-s", &host_list),
            ("--communal-storage-location", args.communal_path),
        ],
        &[],
    );
    run(runner, "revive_db", &args.pods[0], argv, args.timeout).await?;
    Ok(())
}

pub async fn start_db(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
    target: ClusterTarget<'_>,
    timeout: Duration,
) -> Result<()> {
    let mut pairs = vec![("-d", db_name)];
    if let ClusterTarget::Sandbox(sandbox) = target {
        pairs.push(("--sandbox", sandbox));
    }
    let argv = argv("start_db", &pairs, &["--noprompt"]);
    run(runner, "start_db", initiator, argv, timeout).await?;
    Ok(())
}

pub async fn stop_db(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
    target: ClusterTarget<'_>,
) -> Result<()> {
    let mut pairs = vec![("-d", db_name)];
    if let ClusterTarget::Sandbox(sandbox) = target {
        pairs.push(("--sandbox", sandbox));
    }
    let argv = argv("stop_db", &pairs, &["--force", "--noprompt"]);
    run(runner, "stop_db", initiator, argv, DEFAULT_ADMIN_TIMEOUT).await?;
    Ok(())
}

pub async fn stop_node(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
    node: &PodRef,
) -> Result<()> {
    let argv = argv(
        "stop_node",
        &[("-d", db_name), ("-s", &node.dns_name)],
        &["--noprompt"],
    );
    run(runner, "stop_node", initiator, argv, DEFAULT_ADMIN_TIMEOUT).await?;
    Ok(())
}

pub async fn restart_node(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
    node: &PodRef,
) -> Result<()> {
    let argv = argv(
        "restart_node",
        &[("-d", db_name), ("-s", &node.dns_name)],
        &["--noprompt"],
    );
    run(runner, "restart_node", initiator, argv, DEFAULT_ADMIN_TIMEOUT).await?;
    Ok(())
}

pub async fn add_node(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
    new_node: &PodRef,
    subcluster: &str,
) -> Result<()> {
    let argv = argv(
        "db_add_node",
        &[
            ("-d", db_name),
            ("-s", &new_node.dns_name),
            ("-c", subcluster),
        ],
        &["--noprompt"],
    );
    run(runner, "add_node", initiator, argv, DEFAULT_ADMIN_TIMEOUT).await?;
    Ok(())
}

pub async fn remove_node(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
    node: &PodRef,
) -> Result<()> {
    let argv = argv(
        "db_remove_node",
        &[("-d", db_name), ("-s", &node.dns_name)],
        &["--noprompt"],
    );
    run(runner, "remove_node", initiator, argv, DEFAULT_ADMIN_TIMEOUT).await?;
    Ok(())
}

pub async fn sandbox_subcluster(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
    sandbox: &str,
    subcluster: &str,
) -> Result<()> {
    let argv = argv(
        "sandbox_subcluster",
        &[("-d", db_name), ("-c", subcluster), ("--sandbox", sandbox)],
        &["--noprompt"],
    );
    run(
        runner,
        "sandbox_subcluster",
        initiator,
        argv,
        DEFAULT_ADMIN_TIMEOUT,
    )
    .await?;
    Ok(())
}

pub async fn unsandbox_subcluster(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
    subcluster: &str,
) -> Result<()> {
    let argv = argv(
        "unsandbox_subcluster",
        &[("-d", db_name), ("-c", subcluster)],
        &["--noprompt"],
    );
    run(
        runner,
        "unsandbox_subcluster",
        initiator,
        argv,
        DEFAULT_ADMIN_TIMEOUT,
    )
    .await?;
    Ok(())
}

pub async fn replicate_db(
    runner: &PodRunner,
    initiator: &PodRef,
    args: &ReplicateDbArgs<'_>,
) -> Result<()> {
    let argv = argv(
        "replicate_db",
        &[
            ("-d", args.db_name),
            ("--target-hosts", args.target_host),
            ("--sandbox", args.sandbox),
        ],
        &["--noprompt"],
    );
    run(runner, "replicate_db", initiator, argv, args.timeout).await?;
    Ok(())
}

pub async fn save_restore_point(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
    archive: &str,
) -> Result<String> {
    let argv = argv(
        "save_restore_point",
        &[("-d", db_name), ("--archive", archive)],
        &[],
    );
    let output = run(
        runner,
        "save_restore_point",
        initiator,
        argv,
        DEFAULT_ADMIN_TIMEOUT,
    )
    .await?;
    parse_saved_restore_point(&output.stdout).ok_or_else(|| {
        Error::ParseError(format!(
            "no restore point id in save_restore_point output: {}",
            output.stdout
        ))
    })
}

pub async fn show_restore_points(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
) -> Result<Vec<RestorePoint>> {
    let argv = argv("show_restore_points", &[("-d", db_name)], &[]);
    let output = run(
        runner,
        "show_restore_points",
        initiator,
        argv,
        DEFAULT_ADMIN_TIMEOUT,
    )
    .await?;
    Ok(parse_restore_points(&output.stdout))
}

pub async fn list_nodes(
    runner: &PodRunner,
    db_name: &str,
    initiator: &PodRef,
) -> Result<Vec<NodeState>> {
    let argv = argv("list_allnodes", &[("-d", db_name)], &[]);
    let output = run(runner, "list_nodes", initiator, argv, DEFAULT_ADMIN_TIMEOUT).await?;
    Ok(parse_node_states(&output.stdout))
}

pub fn parse_node_states(output: &str) -> Vec<NodeState> {
    NODE_LINE_RE
        .captures_iter(output)
        .map(|caps| NodeState {
            name: caps["name"].to_string(),
            host: caps["host"].to_string(),
            up: &caps["state"] == "UP",
            version: caps.name("version").map(|m| m.as_str().to_string()),
        })
        .collect()
}

pub fn parse_restore_points(output: &str) -> Vec<RestorePoint> {
    RESTORE_POINT_LINE_RE
        .captures_iter(output)
        .map(|caps| RestorePoint {
            index: caps["index"].parse().unwrap_or(0),
            id: caps["id"].to_string(),
            archive: caps["archive"].to_string(),
            timestamp: caps["ts"].trim().to_string(),
        })
        .collect()
}

pub fn parse_saved_restore_point(output: &str) -> Option<String> {
    SAVED_RESTORE_POINT_RE
        .captures(output)
        .map(|caps| caps["id"].to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    const LIST_ALLNODES: &str = r#"
 Node               | Host        | State | Version        | DB
--------------------+-------------+-------+----------------+--------
 v_vertdb_node0001  | 10.244.1.17 | UP    | vertica-24.3.0 | vertdb
 v_vertdb_node0002  | 10.244.2.4  | UP    | vertica-24.3.0 | vertdb
 v_vertdb_node0003  | 10.244.3.9  | DOWN  | vertica-24.3.0 | vertdb
"#;

    #[test]
    fn test_parse_node_states() {
        let nodes = parse_node_states(LIST_ALLNODES);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].name, "v_vertdb_node0001");
        assert_eq!(nodes[0].host, "10.244.1.17");
        assert!(nodes[0].up);
        assert_eq!(nodes[0].version.as_deref(), Some("vertica-24.3.0"));
        assert!(!nodes[2].up);
    }

    #[test]
    fn test_parse_node_states_empty() {
        assert!(parse_node_states("no database defined").is_empty());
    }

    const SHOW_RESTORE_POINTS: &str = r#"
 Index | ID          | Archive   | Timestamp
-------+-------------+-----------+---------------------
     1 | sp_20240709 | archive_a | 2024-07-09 09:15:02
     2 | sp_20240710 | archive_a | 2024-07-10 12:01:44
"#;

    #[test]
    fn test_parse_restore_points() {
        let points = parse_restore_points(SHOW_RESTORE_POINTS);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].index, 1);
        assert_eq!(points[0].id, "sp_20240709");
        assert_eq!(points[1].archive, "archive_a");
        assert_eq!(points[1].timestamp, "2024-07-10 12:01:44");
    }

    #[test]
    fn test_parse_saved_restore_point() {
        assert_eq!(
            parse_saved_restore_point("Restore point saved: sp_20240710\n").as_deref(),
            Some("sp_20240710")
        );
        assert_eq!(parse_saved_restore_point("nothing here"), None);
    }

    #[test]
    fn test_already_done_patterns() {
        assert!(is_already_done("Database with name vertdb already exists"));
        assert!(is_already_done("Database vertdb is already running"));
        assert!(is_already_done(
            "Host v_vertdb_node0004 is already part of the database"
        ));
        assert!(!is_already_done("Error: invalid communal storage location"));
    }

    #[test]
    fn test_retryable_patterns() {
        assert!(is_retryable("Error: Could not connect to spread daemon"));
        assert!(is_retryable("cluster has not converged yet, try again"));
        assert!(!is_retryable("Error: bad option"));
    }

    #[test]
    fn test_classify_exit_code_failure() {
        let err = classify(
            "add_node",
            Error::CommandFailed {
                command: "admintools -t db_add_node".to_string(),
                code: Some(1),
                stderr: "Could not connect to spread daemon".to_string(),
            },
        );
        assert!(matches!(err, Error::AdminRetryable(_, _)));

        let err = classify(
            "create_db",
            Error::CommandFailed {
                command: "admintools -t create_db".to_string(),
                code: Some(1),
                stderr: "invalid communal storage location".to_string(),
            },
        );
        assert!(matches!(err, Error::AdminFatal(_, _)));

        // transport errors are passed through untouched
        let err = classify("create_db", Error::ExecTransient("reset".to_string()));
        assert!(matches!(err, Error::ExecTransient(_)));
    }

    #[test]
    fn test_argv_shape() {
        let v = argv("create_db", &[("-d", "vertdb")], &["--noprompt"]);
        assert_eq!(
            v,
            vec![
                "/opt/vertica/bin/admintools",
                "-t",
                "create_db",
                "-d",
                "vertdb",
                "--noprompt"
            ]
        );
    }
}
