use speculate2::speculate;

speculate! {
    use vdw_core::models::*;
    use vdw_core::{Database, ToolRegistry, VdwError};

    before {
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        let registry = ToolRegistry::new(db);
        for name in ["web-scraping", "storage", "http"] {
            registry
                .ensure_capability(CreateCapabilityInput::named(name))
                .unwrap();
        }
    }

    describe "best tool selection" {
        it "prefers the stronger provider" {
            registry
                .register(
                    CreateToolInput::new("T1", "Scraper one", "p1"),
                    &[CapabilityEdgeInput::new("web-scraping", 0.9, 1.0)],
                    &[],
                )
                .unwrap();
            registry
                .register(
                    CreateToolInput::new("T2", "Scraper two", "p1"),
                    &[CapabilityEdgeInput::new("web-scraping", 0.5, 1.0)],
                    &[],
                )
                .unwrap();

            assert_eq!(registry.find_best_tool("web-scraping").unwrap().tool_id, "T1");
        }

        it "gives the same answer for the same state" {
            for id in ["b", "a", "c"] {
                registry
                    .register(
                        CreateToolInput::new(id, id, "p1"),
                        &[CapabilityEdgeInput::new("storage", 0.6, 0.6)],
                        &[],
                    )
                    .unwrap();
            }
            let first = registry.find_best_tool("storage").unwrap().tool_id;
            assert_eq!(first, "a");
            for _ in 0..10 {
                assert_eq!(registry.find_best_tool("storage").unwrap().tool_id, first);
            }
        }

        it "signals a gap when nobody provides the capability" {
            assert!(matches!(
                registry.find_best_tool("http"),
                Err(VdwError::Gap(_))
            ));
            let report = registry
                .gap_analysis(&["http".to_string(), "web-scraping".to_string()])
                .unwrap();
            assert_eq!(report.missing, vec!["http".to_string(), "web-scraping".to_string()]);
            assert_eq!(report.coverage_score, 0.0);
        }
    }

    describe "dependency graph" {
        before {
            for id in ["A", "B", "C"] {
                registry
                    .register(
                        CreateToolInput::new(id, id, "p1"),
                        &[CapabilityEdgeInput::new("storage", 0.5, 0.5)],
                        &[],
                    )
                    .unwrap();
            }
        }

        it "rejects a requires edge that closes a cycle and keeps the graph unchanged" {
            registry.add_dependency("A", "B", DependencyKind::Requires).unwrap();
            let before = registry.list_dependencies().unwrap();

            let err = registry
                .add_dependency("B", "A", DependencyKind::Requires)
                .unwrap_err();
            assert!(matches!(err, VdwError::Cycle(_)));
            assert_eq!(registry.list_dependencies().unwrap(), before);

            let order: Vec<_> = registry
                .resolve_dependencies("A")
                .unwrap()
                .into_iter()
                .map(|t| t.tool_id)
                .collect();
            assert_eq!(order, vec!["B", "A"]);
            assert!(registry.find_best_tool("storage").is_ok());
        }

        it "rejects a registration with an unknown dependency target" {
            registry.add_dependency("A", "B", DependencyKind::Requires).unwrap();
            let before = registry.list_dependencies().unwrap();

            let err = registry
                .register(
                    CreateToolInput::new("D", "D", "p1"),
                    &[CapabilityEdgeInput::new("storage", 0.5, 0.5)],
                    &[DependencyEdgeInput::requires("missing")],
                )
                .unwrap_err();
            assert!(matches!(err, VdwError::NotFound { kind: "tool", .. }));
            assert!(registry.get_tool("D").unwrap().is_none());
            assert_eq!(registry.list_dependencies().unwrap(), before);
        }

        it "names the conflicting pair when resolving" {
            registry.add_dependency("A", "B", DependencyKind::Conflicts).unwrap();
            registry.add_dependency("C", "A", DependencyKind::Requires).unwrap();
            registry.add_dependency("C", "B", DependencyKind::Requires).unwrap();

            match registry.resolve_dependencies("C") {
                Err(VdwError::Conflict { first, second }) => {
                    assert_eq!((first.as_str(), second.as_str()), ("A", "B"));
                }
                other => panic!("expected a conflict, got {other:?}"),
            }
        }
    }

    describe "lifecycle" {
        before {
            for id in ["A", "B"] {
                registry
                    .register(
                        CreateToolInput::new(id, id, "p1"),
                        &[CapabilityEdgeInput::new("http", 0.8, 0.9)],
                        &[],
                    )
                    .unwrap();
            }
        }

        it "rejects a replacement chain that loops back" {
            registry
                .deprecate(
                    "A",
                    DeprecateToolInput {
                        reason: "superseded".into(),
                        replacement_tool_id: Some("B".into()),
                    },
                )
                .unwrap();

            let err = registry
                .deprecate(
                    "B",
                    DeprecateToolInput {
                        reason: "loop".into(),
                        replacement_tool_id: Some("A".into()),
                    },
                )
                .unwrap_err();
            assert!(matches!(err, VdwError::Cycle(_)));
            assert!(!registry.require_tool("B").unwrap().deprecated);
        }

        it "counts every usage and keeps success rate in range" {
            let outcomes = [true, false, true, true];
            for (i, success) in outcomes.iter().enumerate() {
                let tool = registry
                    .record_usage("A", RecordUsageInput::outcome(*success, 50.0 * (i + 1) as f64))
                    .unwrap();
                assert_eq!(tool.usage_count, i as u64 + 1);
                assert!((0.0..=1.0).contains(&tool.success_rate));
            }
            let tool = registry.require_tool("A").unwrap();
            assert!((tool.success_rate - 0.75).abs() < 1e-9);
            assert!((tool.average_duration - 125.0).abs() < 1e-9);
        }

        it "drops a tool from selection while a serious vulnerability is open" {
            registry
                .record_usage("A", RecordUsageInput::outcome(true, 10.0))
                .unwrap();
            let vuln = registry
                .report_vulnerability(ReportVulnerabilityInput {
                    tool_id: "A".into(),
                    severity: Severity::High,
                    description: "path traversal".into(),
                    cve_id: None,
                })
                .unwrap();
            assert_eq!(registry.find_best_tool("http").unwrap().tool_id, "B");

            registry
                .patch_vulnerability(PatchVulnerabilityInput {
                    vulnerability_id: vuln.vulnerability_id,
                    patched_in_version: None,
                })
                .unwrap();
            assert_eq!(registry.find_best_tool("http").unwrap().tool_id, "A");
        }
    }

    describe "concurrent usage recording" {
        it "keeps every update from threads sharing one registry" {
            registry
                .register(CreateToolInput::new("shared", "shared", "p1"), &[], &[])
                .unwrap();

            let workers: Vec<_> = (0..8)
                .map(|i| {
                    let registry = registry.clone();
                    std::thread::spawn(move || {
                        for _ in 0..25 {
                            registry
                                .record_usage("shared", RecordUsageInput::outcome(i % 2 == 0, 10.0))
                                .unwrap();
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }

            let tool = registry.require_tool("shared").unwrap();
            assert_eq!(tool.usage_count, 200);
            assert!((tool.success_rate - 0.5).abs() < 1e-9);
            assert_eq!(registry.performance_logs("shared").unwrap().len(), 200);
        }

        it "keeps every update from separate connections to one file" {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("registry.db");
            let setup = Database::open(&path).unwrap();
            setup.migrate().unwrap();
            ToolRegistry::new(setup)
                .register(CreateToolInput::new("filed", "filed", "p1"), &[], &[])
                .unwrap();

            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let path = path.clone();
                    std::thread::spawn(move || {
                        let registry = ToolRegistry::new(Database::open(&path).unwrap());
                        for _ in 0..10 {
                            registry
                                .record_usage("filed", RecordUsageInput::outcome(true, 1.0))
                                .unwrap();
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }

            let registry = ToolRegistry::new(Database::open(&path).unwrap());
            assert_eq!(registry.require_tool("filed").unwrap().usage_count, 40);
        }
    }
}
