//! Scheduling integration tests.
//!
//! These tests run the planner over generated task sets and check the
//! structural guarantees every plan must keep, independent of how batches
//! happen to be formed.

use std::collections::HashMap;

use taskweave::config::{BatchingStrategy, EngineConfig, Locality, SelectionConstraints};
use taskweave::core::{
    Agent, AgentId, AtomicTask, Batch, Dependency, DependencyPriority, TaskArena, TaskCategory,
    TaskId,
};
use taskweave::scheduling::{
    analyze, detect_cycles, validate_plan, CapacityBatcher, ExecutionPlan, ExecutionPlanner,
    WorkloadBalancer,
};

use crate::fixtures::{agent, generic, research, task};

/// Deterministic task graph with forward and backward edges, so that some
/// seeds produce cycles.
fn generated_tasks(seed: u64, count: usize) -> Vec<AtomicTask> {
    let mut state = seed;
    let mut next = move |bound: u64| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 33) % bound
    };
    let categories = [
        TaskCategory::Research,
        TaskCategory::Analysis,
        TaskCategory::Creation,
        TaskCategory::Validation,
    ];

    (0..count)
        .map(|i| {
            let category = categories[next(categories.len() as u64) as usize];
            let mut task = task(&format!("t{}", i), &format!("step {} of the report", i), category)
                .with_size(100 + next(3000));
            for _ in 0..next(3) {
                let target = next(count as u64) as usize;
                if target == i {
                    continue;
                }
                let dependency = match next(3) {
                    0 => Dependency::blocking(format!("t{}", target)),
                    1 => Dependency::soft(format!("t{}", target)),
                    _ => Dependency::reference(format!("t{}", target)),
                };
                task = task.with_dependency(dependency.with_priority(DependencyPriority::Medium));
            }
            task
        })
        .collect()
}

fn assert_dependency_order(plan: &ExecutionPlan) {
    let mut position: HashMap<&TaskId, (usize, usize)> = HashMap::new();
    for (stage_index, stage) in plan.stages.iter().enumerate() {
        for (member_index, id) in stage.task_ids.iter().enumerate() {
            assert!(
                position.insert(id, (stage_index, member_index)).is_none(),
                "{} scheduled twice",
                id
            );
        }
    }
    assert_eq!(position.len(), plan.arena.len());

    for task in plan.arena.iter() {
        let (stage, member) = position[&task.id];
        for dependency in task.blocking_dependencies() {
            let Some(&(dep_stage, dep_member)) = position.get(dependency) else {
                continue;
            };
            let earlier_stage = dep_stage < stage;
            let earlier_in_sequence =
                dep_stage == stage && !plan.stages[stage].parallel && dep_member < member;
            assert!(
                earlier_stage || earlier_in_sequence,
                "{} runs before its dependency {}",
                task.id,
                dependency
            );
        }
    }
}

/// Test: Plans keep dependency order for generated graphs
/// Given generated task graphs, some with cycles
/// When planned with both batching strategies
/// Then every task appears once and blocking dependencies run first
#[test]
fn test_generated_plans_respect_dependencies() {
    let agents = [agent("generalist", &[])];
    for strategy in [BatchingStrategy::Capacity, BatchingStrategy::Affinity] {
        let mut config = EngineConfig::default();
        config.batching.strategy = strategy;
        let planner = ExecutionPlanner::new(&config);

        for seed in 1..=25 {
            let plan = planner
                .plan_with_agents(generated_tasks(seed, 18), &agents)
                .unwrap_or_else(|e| panic!("seed {} ({:?}) failed: {}", seed, strategy, e));
            assert_dependency_order(&plan);
            assert!(validate_plan(&plan.stages, &plan.arena).is_ok());
            assert!(detect_cycles(&plan.arena).is_empty());
            assert_eq!(plan.assignments.len(), plan.stages.len());
        }
    }
}

/// Test: Acyclic input is left untouched
/// Given an acyclic task graph
/// When cycles are resolved
/// Then no edges are dropped and the dependency lists are identical
#[test]
fn test_acyclic_resolution_is_noop() {
    let tasks = vec![
        generic("a"),
        generic("b").depends_on("a"),
        generic("c").with_dependency(Dependency::soft("b")),
        generic("d").depends_on("a").depends_on("c"),
    ];
    let mut arena = TaskArena::from_tasks(tasks.clone());
    let analysis = analyze(&mut arena);

    assert!(!analysis.report.has_cycles);
    assert!(analysis.report.dropped_edges.is_empty());
    for original in &tasks {
        assert_eq!(arena.get(&original.id).unwrap().dependencies, original.dependencies);
    }
}

/// Test: Cycle breaking prefers the weakest edge
/// Given a cycle with one blocking edge and one reference edge
/// When cycles are resolved
/// Then the reference edge is dropped
#[test]
fn test_weakest_edge_dropped() {
    let mut arena = TaskArena::from_tasks(vec![
        generic("a").depends_on("b"),
        generic("b").with_dependency(Dependency::reference("a")),
    ]);
    let analysis = analyze(&mut arena);

    let dropped = &analysis.report.dropped_edges;
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].from, TaskId::from("b"));
    assert_eq!(dropped[0].to, TaskId::from("a"));
    assert!(arena.get(&TaskId::from("a")).unwrap().blocks_on(&TaskId::from("b")));
}

/// Test: Capacity limits hold
/// Given generated tasks with varied sizes
/// When batched by capacity
/// Then no batch exceeds the size limit and only single oversized tasks
/// exceed the token limit
#[test]
fn test_capacity_limits_hold() {
    let mut config = EngineConfig::default();
    config.batching.max_batch_size = 4;
    config.batching.max_tokens_per_batch = 2500;
    let batcher = CapacityBatcher::new(&config.batching);

    for seed in 1..=25 {
        let mut arena = TaskArena::from_tasks(generated_tasks(seed, 20));
        let analysis = analyze(&mut arena);
        let outcome = batcher.compose(&arena, &analysis.order);

        let placed: usize = outcome.batches.iter().map(Batch::len).sum();
        assert_eq!(placed, arena.len());
        for batch in &outcome.batches {
            assert!(batch.len() <= 4);
            assert!(
                batch.estimated_tokens <= 2500 || batch.len() == 1,
                "seed {}: batch of {} members holds {} tokens",
                seed,
                batch.len(),
                batch.estimated_tokens
            );
        }
        assert_eq!(outcome.stats.total_tasks, arena.len());
        assert_eq!(outcome.stats.oversized_tasks, outcome.oversized.len());
    }
}

/// Test: Balancing a balanced set is a no-op
/// Given batches with equal load
/// When balanced twice
/// Then neither pass moves a task
#[test]
fn test_balancing_balanced_batches_is_idempotent() {
    let arena = TaskArena::from_tasks(
        (0..6).map(|i| generic(&format!("t{}", i)).with_duration_ms(1_000).with_size(100)),
    );
    let batches = vec![
        Batch::new(vec!["t0".into(), "t1".into()], true, &arena),
        Batch::new(vec!["t2".into(), "t3".into()], true, &arena),
        Batch::new(vec!["t4".into(), "t5".into()], true, &arena),
    ];

    let balancer = WorkloadBalancer::new();
    let first = balancer.balance(batches, &arena);
    assert_eq!(first.moves, 0);
    let second = balancer.balance(first.batches, &arena);
    assert_eq!(second.moves, 0);
    assert_eq!(second.batches.len(), 3);
}

/// Test: Batches no single agent can serve are split
/// Given two independent tasks needing different capabilities
/// When planned against two specialist agents
/// Then each task gets its own stage and its own specialist
#[test]
fn test_uncoverable_batch_split_per_member() {
    let planner = ExecutionPlanner::new(&EngineConfig::default());
    let plan = planner
        .plan_with_agents(
            vec![
                generic("draw").with_capabilities(["image_generation"]),
                generic("speak").with_capabilities(["speech_synthesis"]),
            ],
            &[
                agent("painter", &["image_generation"]),
                agent("narrator", &["speech_synthesis"]),
            ],
        )
        .unwrap();

    assert_eq!(plan.stages.len(), 2);
    let assigned: Vec<(&str, &str)> = plan
        .stages
        .iter()
        .map(|stage| {
            let selection = plan.assignment(&stage.id).unwrap();
            (stage.task_ids[0].as_str(), selection.primary.as_str())
        })
        .collect();
    assert!(assigned.contains(&("draw", "painter")));
    assert!(assigned.contains(&("speak", "narrator")));
}

/// Test: Configured selection constraints shape assignments
/// Given a remote agent listed first and a cheaper local agent
/// When planned with provider, locality and cost constraints in the config
/// Then only agents meeting every constraint are assigned, and planning
/// fails with agent_unavailable when none do
#[test]
fn test_selection_constraints_apply_to_plans() {
    let agents = || -> Vec<Agent> {
        let mut local = agent("homelab", &["summarize"]).with_provider("homelab").with_cost(0.02);
        local.local = true;
        vec![
            agent("cloud", &["summarize"]).with_provider("cloudco").with_cost(0.05),
            local,
        ]
    };
    let tasks = || vec![generic("digest").with_capabilities(["summarize"])];
    let chain_for = |config: &EngineConfig| -> Vec<AgentId> {
        let plan = ExecutionPlanner::new(config)
            .plan_with_agents(tasks(), &agents())
            .unwrap();
        plan.assignment(&plan.stages[0].id).unwrap().chain()
    };

    let unconstrained = EngineConfig::default();
    assert_eq!(chain_for(&unconstrained)[0].as_str(), "cloud");

    let mut excluding = EngineConfig::default();
    excluding.selection.constraints.exclude_providers.insert("cloudco".into());
    assert_eq!(chain_for(&excluding), vec![AgentId::from("homelab")]);

    let mut local_only = EngineConfig::default();
    local_only.selection.constraints.locality = Locality::LocalOnly;
    assert_eq!(chain_for(&local_only), vec![AgentId::from("homelab")]);

    let planner = ExecutionPlanner::new(&EngineConfig::default()).with_constraints(
        SelectionConstraints {
            locality: Locality::LocalOnly,
            max_cost_per_unit: Some(0.01),
            ..SelectionConstraints::default()
        },
    );
    let err = planner.plan_with_agents(tasks(), &agents()).unwrap_err();
    assert_eq!(err.kind().as_str(), "agent_unavailable");
}

/// Test: Plan metadata
/// Given a chain a -> b -> c plus an independent task
/// When planned
/// Then levels, critical path and total duration are reported and the
/// plan serializes to JSON
#[test]
fn test_plan_levels_and_critical_path() {
    let planner = ExecutionPlanner::new(&EngineConfig::default());
    let plan = planner
        .plan_with_agents(
            vec![
                generic("a").with_duration_ms(1_000),
                generic("b").with_duration_ms(2_000).depends_on("a"),
                generic("c").with_duration_ms(3_000).depends_on("b"),
                research("side", "background reading").with_duration_ms(500),
            ],
            &[agent("generalist", &[])],
        )
        .unwrap();

    assert_eq!(plan.levels[&TaskId::from("a")], 0);
    assert_eq!(plan.levels[&TaskId::from("b")], 1);
    assert_eq!(plan.levels[&TaskId::from("c")], 2);
    assert_eq!(
        plan.critical_path,
        vec![TaskId::from("a"), TaskId::from("b"), TaskId::from("c")]
    );
    assert_eq!(plan.critical_path_ms, 6_000);
    assert_eq!(
        plan.total_estimated_duration_ms,
        plan.stage_durations_ms.iter().sum::<u64>()
    );

    let json: serde_json::Value = serde_json::from_str(&plan.to_json().unwrap()).unwrap();
    assert_eq!(json["stages"].as_array().unwrap().len(), plan.stages.len());
    assert!(json.get("arena").is_none());
}

/// Test: Huge size estimates
/// Given a chain whose estimated sizes overflow any duration sum
/// When planned
/// Then the oversized tasks run alone and durations saturate
#[test]
fn test_huge_estimates_saturate() {
    let planner = ExecutionPlanner::new(&EngineConfig::default());
    let plan = planner
        .plan_with_agents(
            vec![
                generic("a").with_size(u64::MAX / 4),
                generic("b").with_size(u64::MAX / 2).depends_on("a"),
                generic("c").with_size(100),
            ],
            &[agent("generalist", &[])],
        )
        .unwrap();

    assert_eq!(plan.task_count(), 3);
    assert_eq!(plan.stage_of(&TaskId::from("a")).map(|i| plan.stages[i].len()), Some(1));
    assert_eq!(plan.critical_path_ms, u64::MAX);
    assert_eq!(plan.total_estimated_duration_ms, u64::MAX);
    assert!(validate_plan(&plan.stages, &plan.arena).is_ok());
}

/// Test: Empty input
/// Given no tasks
/// When planned
/// Then the plan is empty rather than an error
#[test]
fn test_empty_input_yields_empty_plan() {
    let planner = ExecutionPlanner::new(&EngineConfig::default());
    let plan = planner.plan_with_agents(Vec::new(), &[]).unwrap();
    assert!(plan.stages.is_empty());
    assert_eq!(plan.task_count(), 0);
}
