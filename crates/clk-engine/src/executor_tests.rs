//! End-to-end engine scenarios over a scripted actuator.

use super::*;
use crate::actuator::CliRequest;
use crate::{Actuator, ExecuteOptions, Timings};
use clk_ai::Oracle;
use clk_core::{HealPolicy, Plan, PlanCommand};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

/// Scripted actuator: per-(service, op) FIFO response queues. The last
/// response in a queue is sticky, and unknown commands succeed with `{}`.
struct Scripted {
    queues: Mutex<HashMap<(String, String), VecDeque<(i32, String)>>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl Scripted {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn on(&self, service: &str, op: &str, exit_code: i32, body: &str) {
        self.queues
            .lock()
            .unwrap()
            .entry((service.to_string(), op.to_string()))
            .or_default()
            .push_back((exit_code, body.to_string()));
    }

    fn calls_for(&self, service: &str, op: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|args| {
                args.first().map(String::as_str) == Some(service)
                    && args.get(1).map(String::as_str) == Some(op)
            })
            .cloned()
            .collect()
    }

    fn call_count(&self, service: &str, op: &str) -> usize {
        self.calls_for(service, op).len()
    }
}

#[async_trait::async_trait]
impl Actuator for Scripted {
    async fn run(&self, req: &CliRequest) -> anyhow::Result<clk_process::CliOutput> {
        self.calls.lock().unwrap().push(req.args.clone());
        let key = (
            req.args.first().cloned().unwrap_or_default(),
            req.args.get(1).cloned().unwrap_or_default(),
        );
        let mut queues = self.queues.lock().unwrap();
        let (exit_code, merged) = match queues.get_mut(&key) {
            Some(queue) if !queue.is_empty() => {
                let response = queue.pop_front().unwrap();
                if queue.is_empty() {
                    queue.push_back(response.clone());
                }
                response
            }
            _ => (0, "{}".to_string()),
        };
        Ok(clk_process::CliOutput { merged, exit_code })
    }
}

/// Oracle that replays canned replies in order.
struct ScriptedOracle {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedOracle {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait::async_trait]
impl Oracle for ScriptedOracle {
    async fn ask(&self, _prompt: &str) -> anyhow::Result<String> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("oracle script exhausted"))
    }
}

fn plan_of(commands: Vec<PlanCommand>) -> Plan {
    let mut plan =
        Plan::from_json(r#"{"question": "deploy a web app", "commands": []}"#).unwrap();
    plan.commands = commands;
    plan
}

fn fast_opts(checkpoint_dir: std::path::PathBuf) -> ExecuteOptions {
    ExecuteOptions {
        timings: Timings::fast(),
        checkpoint_dir: Some(checkpoint_dir),
        ..ExecuteOptions::default()
    }
}

#[tokio::test]
async fn learns_bindings_and_substitutes_later_commands() {
    let tmp = tempdir().unwrap();
    let actuator = Scripted::new();
    actuator.on("ec2", "create-security-group", 0, r#"{"GroupId": "sg-aaa"}"#);

    let plan = plan_of(vec![
        PlanCommand::new(&[
            "ec2", "create-security-group", "--group-name", "alb-sg", "--vpc-id", "vpc-x",
        ]),
        PlanCommand::new(&[
            "ec2", "authorize-security-group-ingress", "--group-id", "<SG_ALB_ID>",
            "--protocol", "tcp", "--port", "80",
        ]),
    ]);

    let mut out = BTreeMap::new();
    execute_plan_with(&plan, fast_opts(tmp.path().into()), actuator.clone(), Some(&mut out))
        .await
        .unwrap();

    let authorize = actuator.calls_for("ec2", "authorize-security-group-ingress");
    assert_eq!(authorize.len(), 1);
    assert!(authorize[0].contains(&"sg-aaa".to_string()));
    // canonical key and alias both visible to the caller
    assert_eq!(out.get("SG_ALB_ID").map(String::as_str), Some("sg-aaa"));
    assert_eq!(out.get("ALB_SG_ID").map(String::as_str), Some("sg-aaa"));
}

#[tokio::test]
async fn idempotent_create_is_ignored_and_checkpoint_cleared() {
    let tmp = tempdir().unwrap();
    let store_dir: std::path::PathBuf = tmp.path().into();
    let actuator = Scripted::new();
    actuator.on(
        "iam",
        "create-role",
        254,
        "An error occurred (EntityAlreadyExists) when calling the CreateRole operation: Role r already exists",
    );

    let plan = plan_of(vec![PlanCommand::new(&["iam", "create-role", "--role-name", "r"])]);
    execute_plan_with(&plan, fast_opts(store_dir.clone()), actuator.clone(), None)
        .await
        .unwrap();

    assert_eq!(actuator.call_count("iam", "create-role"), 1);
    // full success deletes the checkpoint file
    let leftover: Vec<_> = std::fs::read_dir(&store_dir)
        .map(|d| d.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(leftover.is_empty(), "checkpoint should be cleared: {leftover:?}");
}

#[tokio::test]
async fn cidr_range_remediation_rewrites_and_retries() {
    let tmp = tempdir().unwrap();
    let actuator = Scripted::new();
    actuator.on(
        "ec2",
        "associate-vpc-cidr-block",
        254,
        "An error occurred (InvalidSubnet.Range) when calling the AssociateVpcCidrBlock operation",
    );
    actuator.on("ec2", "associate-vpc-cidr-block", 0, r#"{"CidrBlockAssociation": {}}"#);
    actuator.on(
        "ec2",
        "describe-vpcs",
        0,
        r#"{"Vpcs": [{"CidrBlock": "10.0.0.0/16",
            "CidrBlockAssociationSet": [{"CidrBlock": "10.0.0.0/16"}]}]}"#,
    );

    let plan = plan_of(vec![PlanCommand::new(&[
        "ec2", "associate-vpc-cidr-block", "--vpc-id", "vpc-x", "--cidr-block", "10.0.0.0/24",
    ])]);
    execute_plan_with(&plan, fast_opts(tmp.path().into()), actuator.clone(), None)
        .await
        .unwrap();

    let attempts = actuator.calls_for("ec2", "associate-vpc-cidr-block");
    assert_eq!(attempts.len(), 2);
    // first free /24 in the 10/8 band after the taken /16
    assert!(attempts[1].contains(&"10.1.0.0/24".to_string()));
}

#[tokio::test]
async fn cfn_rollback_rewrites_template_and_switches_to_update() {
    let tmp = tempdir().unwrap();
    let template = r#"{"Resources": {
        "SubnetA": {"Type": "AWS::EC2::Subnet", "Properties": {"VpcId": "vpc-x", "CidrBlock": "10.0.0.0/24"}},
        "SubnetB": {"Type": "AWS::EC2::Subnet", "Properties": {"VpcId": "vpc-x", "CidrBlock": "10.0.0.0/24"}},
        "Role": {"Type": "AWS::IAM::Role", "Properties": {}}
    }}"#;

    let actuator = Scripted::new();
    // create succeeds, then the waiter sees a rolled-back terminal state
    actuator.on("cloudformation", "create-stack", 0, r#"{"StackId": "arn:aws:cloudformation:us-east-1:1:stack/s/1"}"#);
    actuator.on("cloudformation", "describe-stacks", 0, r#"{"Stacks": [{"StackStatus": "ROLLBACK_COMPLETE"}]}"#);
    actuator.on("cloudformation", "describe-stacks", 0, r#"{"Stacks": [{"StackStatus": "ROLLBACK_COMPLETE"}]}"#);
    actuator.on("cloudformation", "describe-stacks", 0, r#"{"Stacks": [{"StackStatus": "UPDATE_COMPLETE"}]}"#);
    actuator.on(
        "cloudformation",
        "describe-stack-events",
        0,
        r#"{"StackEvents": [
            {"LogicalResourceId": "SubnetA", "ResourceStatus": "CREATE_FAILED",
             "ResourceStatusReason": "invalid CIDR block 10.0.0.0/24"}
        ]}"#,
    );
    actuator.on("cloudformation", "update-stack", 0, r#"{"StackId": "arn:aws:cloudformation:us-east-1:1:stack/s/1"}"#);

    let mut cmd = PlanCommand::new(&["cloudformation", "create-stack", "--stack-name", "s"]);
    cmd.args.push("--template-body".to_string());
    cmd.args.push(template.to_string());

    let mut opts = fast_opts(tmp.path().into());
    // keep the transient tier out of the way so the flow is purely glue
    opts.heal_policy = HealPolicy {
        transient_retries: 0,
        ..HealPolicy::default()
    };
    let actuator_arc: Arc<dyn Actuator> = actuator.clone();
    execute_plan_with(&plan_of(vec![cmd]), opts, actuator_arc, None)
        .await
        .unwrap();

    let updates = actuator.calls_for("cloudformation", "update-stack");
    assert_eq!(updates.len(), 1);
    let body_idx = updates[0].iter().position(|a| a == "--template-body").unwrap();
    let rewritten: serde_json::Value = serde_json::from_str(&updates[0][body_idx + 1]).unwrap();
    let cidr_a = rewritten["Resources"]["SubnetA"]["Properties"]["CidrBlock"]
        .as_str()
        .unwrap();
    let cidr_b = rewritten["Resources"]["SubnetB"]["Properties"]["CidrBlock"]
        .as_str()
        .unwrap();
    assert_ne!(cidr_a, cidr_b, "subnets must get distinct blocks");
    assert!(cidr_a.ends_with("/24") && cidr_b.ends_with("/24"));
}

#[tokio::test]
async fn oracle_inference_binds_unresolved_placeholder() {
    let tmp = tempdir().unwrap();
    let actuator = Scripted::new();
    let oracle = ScriptedOracle::new(&[r#"{"SG_RDS_ID": "sg-bbb"}"#]);

    let plan = plan_of(vec![PlanCommand::new(&[
        "ec2", "authorize-security-group-ingress", "--group-id", "<SG_RDS_ID>",
        "--protocol", "tcp", "--port", "5432",
    ])]);

    let mut opts = fast_opts(tmp.path().into());
    opts.oracle = Some(oracle);
    execute_plan_with(&plan, opts, actuator.clone(), None)
        .await
        .unwrap();

    let calls = actuator.calls_for("ec2", "authorize-security-group-ingress");
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains(&"sg-bbb".to_string()));
}

#[tokio::test]
async fn agentic_skip_marks_command_done() {
    let tmp = tempdir().unwrap();
    let actuator = Scripted::new();
    actuator.on(
        "ec2",
        "run-instances",
        254,
        "An error occurred (InsufficientInstanceCapacity) when calling the RunInstances operation",
    );
    // inference is not triggered (no placeholders); remediation asks three
    // times, agentic once.
    let oracle = ScriptedOracle::new(&["[]", "[]", "[]", r#"{"skip": true, "notes": "capacity issue, instance exists"}"#]);

    let plan = plan_of(vec![PlanCommand::new(&["ec2", "run-instances", "--image-id", "ami-1"])]);
    let mut opts = fast_opts(tmp.path().into());
    opts.oracle = Some(oracle);
    execute_plan_with(&plan, opts, actuator.clone(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn hard_failure_reports_index_and_resume_skips_done_work() {
    let tmp = tempdir().unwrap();
    let store_dir: std::path::PathBuf = tmp.path().into();

    let first = Scripted::new();
    first.on("ec2", "create-vpc", 0, r#"{"Vpc": {"VpcId": "vpc-1", "CidrBlock": "10.0.0.0/16"}}"#);
    first.on(
        "ec2",
        "run-instances",
        254,
        "An error occurred (InsufficientInstanceCapacity) when calling the RunInstances operation",
    );

    let plan = plan_of(vec![
        PlanCommand::new(&["ec2", "create-vpc", "--cidr-block", "10.0.0.0/16"]),
        PlanCommand::new(&["ec2", "run-instances", "--image-id", "ami-1", "--subnet-id", "sub-1"]),
    ]);

    let err = execute_plan_with(&plan, fast_opts(store_dir.clone()), first.clone(), None)
        .await
        .unwrap_err();
    assert_eq!(err.command_index(), Some(1));

    // second run: same plan + options resumes at command 2
    let second = Scripted::new();
    second.on("ec2", "run-instances", 0, r#"{"Instances": [{"InstanceId": "i-9"}]}"#);
    let mut out = BTreeMap::new();
    execute_plan_with(&plan, fast_opts(store_dir), second.clone(), Some(&mut out))
        .await
        .unwrap();

    assert_eq!(second.call_count("ec2", "create-vpc"), 0, "must not re-run command 1");
    assert_eq!(second.call_count("ec2", "run-instances"), 1);
    // binding learned in run 1 survived through the checkpoint
    assert_eq!(out.get("VPC_ID").map(String::as_str), Some("vpc-1"));
    assert_eq!(out.get("INSTANCE_ID").map(String::as_str), Some("i-9"));
}

#[tokio::test]
async fn destructive_verbs_require_destroyer_mode() {
    let tmp = tempdir().unwrap();
    let plan = plan_of(vec![PlanCommand::new(&[
        "ec2", "terminate-instances", "--instance-ids", "i-1",
    ])]);

    let err = execute_plan_with(
        &plan,
        fast_opts(tmp.path().join("a")),
        Scripted::new(),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::Rejected { index: 0, .. }));

    let mut opts = fast_opts(tmp.path().join("b"));
    opts.destroyer = true;
    execute_plan_with(&plan, opts, Scripted::new(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn transient_throttle_retries_then_succeeds() {
    let tmp = tempdir().unwrap();
    let actuator = Scripted::new();
    actuator.on("dynamodb", "create-table", 254, "An error occurred (ThrottlingException): Rate exceeded");
    actuator.on("dynamodb", "create-table", 0, r#"{"TableDescription": {"TableName": "t"}}"#);

    let plan = plan_of(vec![PlanCommand::new(&["dynamodb", "create-table", "--table-name", "t"])]);
    execute_plan_with(&plan, fast_opts(tmp.path().into()), actuator.clone(), None)
        .await
        .unwrap();
    assert_eq!(actuator.call_count("dynamodb", "create-table"), 2);
}

#[tokio::test]
async fn healing_budget_exhaustion_hard_fails() {
    let tmp = tempdir().unwrap();
    let actuator = Scripted::new();
    actuator.on("dynamodb", "create-table", 254, "An error occurred (ThrottlingException): Rate exceeded");

    let mut opts = fast_opts(tmp.path().into());
    opts.heal_policy = HealPolicy {
        max_auto_heal_attempts: 1,
        transient_retries: 5,
        ..HealPolicy::default()
    };
    let plan = plan_of(vec![PlanCommand::new(&["dynamodb", "create-table", "--table-name", "t"])]);
    let err = execute_plan_with(&plan, opts, actuator, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Budget { index: 0, .. }));
}

#[tokio::test]
async fn local_sleep_is_an_in_process_success() {
    let tmp = tempdir().unwrap();
    let actuator = Scripted::new();
    let plan = plan_of(vec![PlanCommand::new(&["local", "sleep", "0"])]);
    execute_plan_with(&plan, fast_opts(tmp.path().into()), actuator.clone(), None)
        .await
        .unwrap();
    assert!(actuator.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn already_applied_plan_terminates_successfully() {
    let tmp = tempdir().unwrap();
    let actuator = Scripted::new();
    actuator.on(
        "ec2",
        "create-security-group",
        254,
        "An error occurred (InvalidGroup.Duplicate): group already exists",
    );
    actuator.on(
        "iam",
        "create-role",
        254,
        "An error occurred (EntityAlreadyExists): role already exists",
    );
    actuator.on(
        "ec2",
        "authorize-security-group-ingress",
        254,
        "An error occurred (InvalidPermission.Duplicate): rule already exists",
    );

    let plan = plan_of(vec![
        PlanCommand::new(&["ec2", "create-security-group", "--group-name", "alb-sg"]),
        PlanCommand::new(&["iam", "create-role", "--role-name", "r"]),
        PlanCommand::new(&["ec2", "authorize-security-group-ingress", "--group-id", "sg-1"]),
    ]);

    let mut opts = fast_opts(tmp.path().into());
    opts.disable_durable_checkpoint = true;
    execute_plan_with(&plan, opts, actuator, None).await.unwrap();
}

#[tokio::test]
async fn account_id_token_is_resolved_via_sts() {
    let tmp = tempdir().unwrap();
    let actuator = Scripted::new();
    actuator.on("sts", "get-caller-identity", 0, r#"{"Account": "123456789012"}"#);

    let plan = plan_of(vec![PlanCommand::new(&[
        "ecr", "set-repository-policy", "--registry-id", "<YOUR_ACCOUNT_ID>",
        "--repository-name", "app",
    ])]);
    execute_plan_with(&plan, fast_opts(tmp.path().into()), actuator.clone(), None)
        .await
        .unwrap();

    let calls = actuator.calls_for("ecr", "set-repository-policy");
    assert!(calls[0].contains(&"123456789012".to_string()));
    assert_eq!(actuator.call_count("sts", "get-caller-identity"), 1);
}

/// Purpose-built actuator for the post-deploy scenario: targets stay
/// unhealthy until the restart script is sent, then turn healthy.
struct PostDeployWorld {
    restart_sent: AtomicBool,
    commands_sent: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Actuator for PostDeployWorld {
    async fn run(&self, req: &CliRequest) -> anyhow::Result<clk_process::CliOutput> {
        let service = req.args.first().map(String::as_str).unwrap_or("");
        let op = req.args.get(1).map(String::as_str).unwrap_or("");
        let ok = |body: &str| {
            Ok(clk_process::CliOutput {
                merged: body.to_string(),
                exit_code: 0,
            })
        };
        match (service, op) {
            ("elbv2", "describe-target-health") => {
                let state = if self.restart_sent.load(Ordering::SeqCst) {
                    "healthy"
                } else {
                    "unhealthy"
                };
                ok(&format!(
                    r#"{{"TargetHealthDescriptions": [{{"TargetHealth": {{"State": "{state}"}}}}]}}"#
                ))
            }
            ("ssm", "send-command") => {
                let params_idx = req.args.iter().position(|a| a == "--parameters").unwrap();
                let script = req.args[params_idx + 1].clone();
                let id = if script.contains("HOST=0.0.0.0") {
                    self.restart_sent.store(true, Ordering::SeqCst);
                    "c-restart"
                } else {
                    "c-diagnose"
                };
                self.commands_sent.lock().unwrap().push(script);
                ok(&format!(r#"{{"Command": {{"CommandId": "{id}"}}}}"#))
            }
            ("ssm", "get-command-invocation") => {
                let id_idx = req.args.iter().position(|a| a == "--command-id").unwrap();
                if req.args[id_idx + 1] == "c-diagnose" {
                    ok(r#"{"Status": "Success", "StandardOutputContent": "LISTEN=127.0.0.1:8080\nCLANKER_LOOPBACK_ONLY=1\n", "StandardErrorContent": ""}"#)
                } else {
                    ok(r#"{"Status": "Success", "StandardOutputContent": "restarted", "StandardErrorContent": ""}"#)
                }
            }
            ("cloudfront", "list-distributions") => ok(r#"{"DistributionList": {"Items": []}}"#),
            ("cloudfront", "create-distribution") => ok(
                r#"{"Distribution": {"Id": "E1ABC", "DomainName": "d123.cloudfront.net", "Status": "InProgress"}}"#,
            ),
            ("cloudfront", "get-distribution") => {
                ok(r#"{"Distribution": {"Status": "Deployed"}}"#)
            }
            _ => ok("{}"),
        }
    }
}

#[tokio::test]
async fn postdeploy_autofix_restarts_loopback_bound_container() {
    let tmp = tempdir().unwrap();
    let world = Arc::new(PostDeployWorld {
        restart_sent: AtomicBool::new(false),
        commands_sent: Mutex::new(Vec::new()),
    });

    let plan = plan_of(vec![PlanCommand::new(&["ec2", "describe-vpcs"])]);
    let mut seed = BTreeMap::new();
    seed.insert("INSTANCE_ID".to_string(), "i-0abc".to_string());
    seed.insert(
        "TG_ARN".to_string(),
        "arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/tg/x".to_string(),
    );
    seed.insert("ALB_DNS".to_string(), "alb-1.us-east-1.elb.amazonaws.com".to_string());
    seed.insert("APP_PORT".to_string(), "8080".to_string());

    execute_plan_with(
        &plan,
        fast_opts(tmp.path().into()),
        world.clone(),
        Some(&mut seed),
    )
    .await
    .unwrap();

    assert!(world.restart_sent.load(Ordering::SeqCst), "restart script must be sent");
    let scripts = world.commands_sent.lock().unwrap();
    assert_eq!(scripts.len(), 2, "diagnose then restart");
    assert!(scripts[1].contains("BIND=0.0.0.0"));
    // front door populated the https bindings
    assert_eq!(
        seed.get("HTTPS_URL").map(String::as_str),
        Some("https://d123.cloudfront.net")
    );
    assert_eq!(seed.get("CLOUDFRONT_ID").map(String::as_str), Some("E1ABC"));
}

#[tokio::test]
async fn output_bindings_exclude_progress_keys() {
    let tmp = tempdir().unwrap();
    let actuator = Scripted::new();
    actuator.on("ec2", "create-vpc", 0, r#"{"Vpc": {"VpcId": "vpc-1", "CidrBlock": "10.0.0.0/16"}}"#);

    let plan = plan_of(vec![PlanCommand::new(&["ec2", "create-vpc", "--cidr-block", "10.0.0.0/16"])]);
    let mut out = BTreeMap::new();
    execute_plan_with(&plan, fast_opts(tmp.path().into()), actuator, Some(&mut out))
        .await
        .unwrap();

    assert_eq!(out.get("VPC_ID").map(String::as_str), Some("vpc-1"));
    assert!(!out.contains_key("CHECKPOINT_LAST_SUCCESS_INDEX"));
    assert!(!out.contains_key("CHECKPOINT_LAST_FAILURE_INDEX"));
}
