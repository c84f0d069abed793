use super::*;
use crate::bus::Channel;
use crate::compliance::{ComplianceEngine, SchemaNode};
use crate::error::ForbiddenReason;
use crate::node::{Entitlement, EntitlementPatch, Profile, ProfilePatch};
use parking_lot::Mutex;

fn entitlement(id: &str, own: Value, deps: &[&str]) -> EntitlementNode {
    EntitlementNode::new(Entitlement::new(id, own).with_dependencies(deps.iter().copied()))
}

fn registry() -> EntitlementRegistry {
    Registry::new(EngineConfig::default())
}

/// Record every action published on a channel
fn record(bus: &ActionBus, channel: Channel) -> Arc<Mutex<Vec<Action>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(channel, move |action| sink.lock().push(action.clone()));
    seen
}

const READY: Flags = Flags::from_bits_truncate(
    Flags::ACTIVE.bits() | Flags::COMPILED.bits() | Flags::VALID.bits(),
);

#[test]
fn test_root_compiles_on_add() {
    let mut registry = registry();
    registry.add(entitlement("root", json!({"a": 1}), &[])).unwrap();

    assert_eq!(registry.flags("root"), Some(READY));
    assert_eq!(registry.compiled("root").as_deref(), Some(&json!({"a": 1})));
}

#[test]
fn test_add_twice_keeps_first() {
    let mut registry = registry();
    registry.add(entitlement("root", json!({"a": 1}), &[])).unwrap();

    let err = registry
        .add(entitlement("root", json!({"a": 2}), &[]))
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    assert_eq!(registry.flags("root"), Some(READY));
    assert_eq!(registry.compiled("root").as_deref(), Some(&json!({"a": 1})));
}

#[test]
fn test_dependents_wait_for_dependencies() {
    let mut registry = registry();
    registry
        .add(entitlement("child", json!({"b": 2}), &["root"]))
        .unwrap();

    assert_eq!(registry.flags("child"), Some(Flags::ACTIVE));
    assert!(registry.compiled("child").is_none());

    registry.add(entitlement("root", json!({"a": 1}), &[])).unwrap();

    assert_eq!(registry.flags("child"), Some(READY));
    assert_eq!(
        registry.compiled("child").as_deref(),
        Some(&json!({"a": 1, "b": 2}))
    );
}

#[test]
fn test_delete_cascades_and_readd_relinks() {
    let mut registry = registry();
    registry.add(entitlement("root", json!({"a": 1}), &[])).unwrap();
    registry
        .add(entitlement("child", json!({"b": 2}), &["root"]))
        .unwrap();
    registry
        .add(entitlement("leaf", json!({"c": 3}), &["child"]))
        .unwrap();

    let removed = registry.delete("root").unwrap();
    assert_eq!(removed.key(), "root");
    assert!(!registry.contains("root"));

    for key in ["child", "leaf"] {
        assert_eq!(registry.flags(key), Some(Flags::ACTIVE), "{key}");
        assert!(registry.compiled(key).is_none(), "{key}");
    }
    assert!(registry.compiled("root").is_none());

    registry.add(entitlement("root", json!({"a": 9}), &[])).unwrap();
    assert_eq!(
        registry.compiled("leaf").as_deref(),
        Some(&json!({"a": 9, "b": 2, "c": 3}))
    );
}

#[test]
fn test_pinned_and_sealed() {
    let mut registry = registry();
    registry
        .add(EntitlementNode::new(
            Entitlement::new("pinned", json!({})).with_flags(Flags::PINNED),
        ))
        .unwrap();
    registry
        .add(EntitlementNode::new(
            Entitlement::new("sealed", json!({})).with_flags(Flags::SEALED),
        ))
        .unwrap();

    assert!(matches!(
        registry.delete("pinned").unwrap_err(),
        EngineError::Forbidden {
            reason: ForbiddenReason::Pinned,
            ..
        }
    ));
    assert!(registry.contains("pinned"));

    assert!(matches!(
        registry
            .update("sealed", EntitlementPatch::own(json!({"x": 1})))
            .unwrap_err(),
        EngineError::Forbidden {
            reason: ForbiddenReason::Sealed,
            ..
        }
    ));
    assert_eq!(registry.compiled("sealed").as_deref(), Some(&json!({})));
    assert!(registry.delete("sealed").is_ok());
}

#[test]
fn test_unknown_keys() {
    let mut registry = registry();
    assert!(matches!(
        registry.delete("ghost").unwrap_err(),
        EngineError::NotFound(_)
    ));
    assert!(matches!(
        registry
            .update("ghost", EntitlementPatch::default())
            .unwrap_err(),
        EngineError::NotFound(_)
    ));
    assert!(matches!(
        registry.customize("ghost", Flags::ACTIVE).unwrap_err(),
        EngineError::NotFound(_)
    ));
}

#[test]
fn test_cycles_are_rejected() {
    let mut registry = registry();
    registry.add(entitlement("a", json!({}), &["b"])).unwrap();

    let err = registry.add(entitlement("b", json!({}), &["a"])).unwrap_err();
    assert!(matches!(err, EngineError::CyclicDependency(_)));
    assert!(!registry.contains("b"));

    registry.add(entitlement("b", json!({}), &[])).unwrap();
    let err = registry
        .update("b", EntitlementPatch::dependencies(["a"]))
        .unwrap_err();
    assert!(matches!(err, EngineError::CyclicDependency(_)));
    assert_eq!(registry.flags("a"), Some(READY));
}

#[test]
fn test_self_and_duplicate_dependencies_are_rejected() {
    let mut registry = registry();
    assert!(registry.add(entitlement("a", json!({}), &["a"])).is_err());
    assert!(registry
        .add(entitlement("b", json!({}), &["x", "x"]))
        .is_err());
    assert!(registry.is_empty());
}

#[test]
fn test_update_recompiles_dependents() {
    let mut registry = registry();
    registry.add(entitlement("root", json!({"a": 1}), &[])).unwrap();
    registry
        .add(entitlement("child", json!({"b": 2}), &["root"]))
        .unwrap();

    registry
        .update("root", EntitlementPatch::own(json!({"a": 5})))
        .unwrap();

    assert_eq!(registry.flags("child"), Some(READY));
    assert_eq!(
        registry.compiled("child").as_deref(),
        Some(&json!({"a": 5, "b": 2}))
    );
}

#[test]
fn test_metadata_update_keeps_compiled_value() {
    let mut registry = registry();
    registry.add(entitlement("root", json!({"a": 1}), &[])).unwrap();
    let before = registry.compiled("root").unwrap();

    let metadata = crate::node::EntitlementMetadata {
        label: Some("Root".to_string()),
        ..Default::default()
    };
    registry
        .update("root", EntitlementPatch::metadata(metadata))
        .unwrap();

    assert!(Arc::ptr_eq(&before, &registry.compiled("root").unwrap()));
    assert_eq!(
        registry.get("root").unwrap().entitlement().metadata.label.as_deref(),
        Some("Root")
    );
}

#[test]
fn test_update_relinks_dependencies() {
    let mut registry = registry();
    registry.add(entitlement("left", json!({"side": "left"}), &[])).unwrap();
    registry.add(entitlement("right", json!({"side": "right"}), &[])).unwrap();
    registry
        .add(entitlement("child", json!({}), &["left"]))
        .unwrap();

    registry
        .update("child", EntitlementPatch::dependencies(["right"]))
        .unwrap();
    assert_eq!(
        registry.compiled("child").as_deref(),
        Some(&json!({"side": "right"}))
    );

    // The old dependency no longer reaches the child
    registry.delete("left").unwrap();
    assert_eq!(registry.flags("child"), Some(READY));
}

#[test]
fn test_customize_deactivates_and_reactivates() {
    let mut registry = registry();
    registry.add(entitlement("root", json!({"a": 1}), &[])).unwrap();
    registry
        .add(entitlement("child", json!({"b": 2}), &["root"]))
        .unwrap();

    registry.customize("root", Flags::empty()).unwrap();
    assert_eq!(
        registry.flags("root"),
        Some(Flags::COMPILED | Flags::VALID)
    );
    assert_eq!(registry.flags("child"), Some(Flags::ACTIVE));
    assert!(registry.compiled("child").is_none());

    registry.customize("root", Flags::ACTIVE).unwrap();
    assert_eq!(registry.flags("root"), Some(READY));
    assert_eq!(registry.flags("child"), Some(READY));
}

#[test]
fn test_customize_cannot_set_derived_flags() {
    let mut registry = registry();
    registry.add(entitlement("child", json!({}), &["missing"])).unwrap();

    registry
        .customize("child", Flags::ACTIVE | Flags::VALID | Flags::PINNED)
        .unwrap();
    assert_eq!(registry.flags("child"), Some(Flags::ACTIVE | Flags::PINNED));
}

#[test]
fn test_clear_cache_rebuilds() {
    let mut registry = registry();
    registry.add(entitlement("root", json!({"a": 1}), &[])).unwrap();
    registry
        .add(entitlement("child", json!({"b": 2}), &["root"]))
        .unwrap();
    let cleared = record(registry.bus(), Channel::kind("[Entitlement] Cache Cleared"));

    registry.clear_cache();

    assert_eq!(cleared.lock().len(), 1);
    assert_eq!(registry.flags("child"), Some(READY));
    assert_eq!(
        registry.compiled("child").as_deref(),
        Some(&json!({"a": 1, "b": 2}))
    );
    assert_eq!(registry.compiler().len(), 2);
}

#[test]
fn test_lifecycle_actions() {
    let mut registry = registry();
    let root_channel = record(registry.bus(), Channel::id("root"));
    let added = record(registry.bus(), Channel::kind("[Entitlement] Add Ok"));
    let directory = record(registry.bus(), Channel::kind(DIRECTORY_PUBLISH));

    registry.add(entitlement("root", json!({"a": 1}), &[])).unwrap();
    registry
        .add(EntitlementNode::new(
            Entitlement::new("quiet", json!({})).with_flags(Flags::IMPLICIT),
        ))
        .unwrap();

    let kinds: Vec<String> = root_channel.lock().iter().map(|a| a.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            "[Entitlement] Add Ok",
            "[Entitlement] Compile Ok",
            "[Entitlement] Validate Ok",
        ]
    );
    assert_eq!(
        root_channel.lock()[1].payload.as_ref(),
        Some(&json!({"a": 1}))
    );

    assert_eq!(added.lock().len(), 2);

    // Implicit entitlements are not announced
    let announced = directory.lock();
    assert_eq!(announced.len(), 1);
    assert_eq!(
        announced[0].payload.as_ref(),
        Some(&json!({"kind": "Entitlement", "id": "root", "value": {"a": 1}}))
    );
}

#[test]
fn test_errors_are_published() {
    let mut registry = registry();
    let errors = record(registry.bus(), Channel::kind("[Entitlement] Add Error"));

    registry.add(entitlement("root", json!({}), &[])).unwrap();
    let _ = registry.add(entitlement("root", json!({}), &[]));

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].payload.as_ref().unwrap()["code"],
        json!("already_exists")
    );
}

#[test]
fn test_verification_failure_blocks_validation() {
    let engine = ComplianceEngine::default();
    let schema: SchemaNode = serde_json::from_value(json!({
        "name": "seats",
        "children": [{"name": "count", "comply": {"rules": [["number.min", 1]]}}]
    }))
    .unwrap();
    engine.load_schema(&schema).unwrap();

    let mut registry = registry().with_verifier(Arc::new(engine));
    let errors = record(registry.bus(), Channel::kind("[Entitlement] Validate Error"));

    registry
        .add(EntitlementNode::new(
            Entitlement::new("bad", json!({"count": 0})).with_resource("seats"),
        ))
        .unwrap();
    registry
        .add(EntitlementNode::new(
            Entitlement::new("good", json!({"count": 3})).with_resource("seats"),
        ))
        .unwrap();

    assert_eq!(registry.flags("bad"), Some(Flags::ACTIVE | Flags::COMPILED));
    assert_eq!(registry.flags("good"), Some(READY));

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    let payload = errors[0].payload.as_ref().unwrap();
    assert_eq!(payload["code"], json!("rule_verification_failure"));
    assert_eq!(payload["report"]["entries"][0]["path"], json!(["seats", "count"]));
}

#[test]
fn test_resource_change_revalidates() {
    let engine = ComplianceEngine::default();
    let schema: SchemaNode = serde_json::from_value(json!({
        "name": "seats",
        "children": [{"name": "count", "comply": {"rules": [["number.min", 1]]}}]
    }))
    .unwrap();
    engine.load_schema(&schema).unwrap();

    let mut registry = registry().with_verifier(Arc::new(engine));
    registry.add(entitlement("plain", json!({"count": 0}), &[])).unwrap();
    assert_eq!(registry.flags("plain"), Some(READY));

    let metadata = crate::node::EntitlementMetadata {
        resource: Some("seats".to_string()),
        ..Default::default()
    };
    registry
        .update("plain", EntitlementPatch::metadata(metadata))
        .unwrap();

    assert_eq!(registry.flags("plain"), Some(Flags::ACTIVE | Flags::COMPILED));
}

#[test]
fn test_deferred_mode_queues_jobs() {
    let mut registry: EntitlementRegistry =
        Registry::new(EngineConfig::default().with_compile_mode(CompileMode::Deferred));
    registry.add(entitlement("root", json!({"a": 1}), &[])).unwrap();
    registry
        .add(entitlement("child", json!({"b": 2}), &["root"]))
        .unwrap();

    assert_eq!(registry.flags("root"), Some(Flags::ACTIVE));
    let outbox = registry.take_outbox();
    assert_eq!(outbox.len(), 1);
    let job = match &outbox[0] {
        CompilerCommand::Compile(job) => job.clone(),
        other => panic!("unexpected command: {:?}", other),
    };
    assert_eq!(job.id, "root");

    let value = Arc::new(json!({"a": 1}));
    registry.apply_compile_outcome(
        "root",
        CompileOutcome::Compiled {
            generation: job.generation,
            value: Arc::clone(&value),
        },
    );
    assert_eq!(registry.flags("root"), Some(READY));

    // A repeated result for the same generation is stale now
    registry.apply_compile_outcome(
        "root",
        CompileOutcome::Compiled {
            generation: job.generation,
            value: Arc::new(json!({"a": 2})),
        },
    );
    assert_eq!(registry.compiled("root"), Some(value));

    // Root becoming valid queued the child
    assert!(registry.has_pending());
    assert!(registry.take_outbox()[0].is_compile_of("child"));
}

#[test]
fn test_deferred_failure_is_published() {
    let mut registry: EntitlementRegistry =
        Registry::new(EngineConfig::default().with_compile_mode(CompileMode::Deferred));
    let errors = record(registry.bus(), Channel::kind("[Entitlement] Compile Error"));
    registry.add(entitlement("root", json!({}), &[])).unwrap();

    let generation = match &registry.take_outbox()[0] {
        CompilerCommand::Compile(job) => job.generation,
        other => panic!("unexpected command: {:?}", other),
    };
    registry.apply_compile_outcome(
        "root",
        CompileOutcome::Failed {
            generation,
            missing: vec!["gone".to_string()],
        },
    );

    assert_eq!(registry.flags("root"), Some(Flags::ACTIVE));
    assert_eq!(
        errors.lock()[0].payload.as_ref().unwrap()["code"],
        json!("missing_dependency")
    );
}

#[test]
fn test_deferred_delete_queues_eviction() {
    let mut registry: EntitlementRegistry =
        Registry::new(EngineConfig::default().with_compile_mode(CompileMode::Deferred));
    registry.add(entitlement("root", json!({}), &[])).unwrap();
    registry.delete("root").unwrap();

    let outbox = registry.take_outbox();
    assert!(outbox.iter().all(|command| !command.is_compile_of("root")));
    assert!(outbox
        .iter()
        .any(|command| matches!(command, CompilerCommand::Evict(ids) if ids == &["root"])));
}

#[test]
fn test_readded_node_ignores_earlier_compile() {
    let mut registry: EntitlementRegistry =
        Registry::new(EngineConfig::default().with_compile_mode(CompileMode::Deferred));
    let compile_job = |outbox: Vec<CompilerCommand>| {
        outbox
            .into_iter()
            .find_map(|command| match command {
                CompilerCommand::Compile(job) => Some(job),
                _ => None,
            })
            .unwrap()
    };

    registry.add(entitlement("root", json!({"v": "old"}), &[])).unwrap();
    let old = compile_job(registry.take_outbox());

    registry.delete("root").unwrap();
    registry.add(entitlement("root", json!({"v": "new"}), &[])).unwrap();
    let new = compile_job(registry.take_outbox());
    assert_ne!(old.generation, new.generation);

    registry.apply_compile_outcome(
        "root",
        CompileOutcome::Compiled {
            generation: old.generation,
            value: Arc::new(json!({"v": "old"})),
        },
    );
    assert_eq!(registry.flags("root"), Some(Flags::ACTIVE));
    assert!(registry.compiled("root").is_none());

    registry.apply_compile_outcome(
        "root",
        CompileOutcome::Compiled {
            generation: new.generation,
            value: Arc::new(json!({"v": "new"})),
        },
    );
    assert_eq!(registry.flags("root"), Some(READY));
    assert_eq!(registry.compiled("root").as_deref(), Some(&json!({"v": "new"})));
}

#[test]
fn test_generate_id_is_fresh() {
    let registry = registry();
    let service = Uuid::new_v4();
    let a = registry.generate_id(&service);
    let b = registry.generate_id(&service);
    assert_ne!(a, b);
    assert!(Uuid::parse_str(&a).is_ok());
}

#[test]
fn test_profile_registry() {
    let mut registry: ProfileRegistry = Registry::new(EngineConfig::default());
    registry
        .add(ProfileNode::new(Profile::new("base", json!({"a": 1}))))
        .unwrap();
    registry
        .add(ProfileNode::new(
            Profile::new("user", json!({"b": 2})).with_dependencies(["base"]),
        ))
        .unwrap();

    assert_eq!(registry.state("user"), Some(ProfileState::Valid));
    assert_eq!(
        registry.compiled("user").as_deref(),
        Some(&json!({"a": 1, "b": 2}))
    );

    registry.delete("base").unwrap();
    assert_eq!(registry.state("user"), Some(ProfileState::Invalid));

    registry
        .update(
            "user",
            ProfilePatch::from(Profile::new("user", json!({"b": 3}))),
        )
        .unwrap();
    assert_eq!(registry.compiled("user").as_deref(), Some(&json!({"b": 3})));
}
