//! Concurrency over a shared cache root: two engines (standing in for two
//! processes) racing on the same entries must serialize through the entry
//! locks and agree on the published result.

mod support;

use galley::{RecipeOutcome, RecipeSpec};
use std::fs;
use std::sync::Arc;
use support::{TestBed, count_of, counter, id, install_payload, key};

#[test]
fn concurrent_engines_build_entry_exactly_once() {
    let bed = TestBed::new();
    let installs = counter();

    let engines: Vec<_> = (0..2).map(|_| bed.engine()).collect();
    let results: Vec<_> = std::thread::scope(|scope| {
        engines
            .iter()
            .map(|engine| {
                let installs = Arc::clone(&installs);
                scope.spawn(move || {
                    let spec = RecipeSpec::builder(id("shared.pkg@1"))
                        .on_install(install_payload(&installs, "shared"))
                        .build()
                        .unwrap();
                    engine.run_full(vec![spec]).unwrap()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });

    for outcomes in &results {
        assert_eq!(outcomes[&key("shared.pkg@1")], RecipeOutcome::Done);
    }
    assert_eq!(
        count_of(&installs),
        1,
        "exactly one engine may run the slow path"
    );

    // Both engines observe identical published contents.
    let assets: Vec<_> = engines
        .iter()
        .map(|e| e.find_exact(&key("shared.pkg@1")).unwrap().asset_path.unwrap())
        .collect();
    assert_eq!(assets[0], assets[1]);
    assert_eq!(
        fs::read_to_string(assets[0].join("payload.txt").as_std_path()).unwrap(),
        "shared"
    );
}

#[test]
fn independent_entries_build_in_parallel() {
    let bed = TestBed::new();
    let installs_a = counter();
    let installs_b = counter();

    let engine_a = bed.engine();
    let engine_b = bed.engine();

    std::thread::scope(|scope| {
        let a = scope.spawn(|| {
            let spec = RecipeSpec::builder(id("pkg.a@1"))
                .on_install(install_payload(&installs_a, "a"))
                .build()
                .unwrap();
            engine_a.run_full(vec![spec]).unwrap()
        });
        let b = scope.spawn(|| {
            let spec = RecipeSpec::builder(id("pkg.b@1"))
                .on_install(install_payload(&installs_b, "b"))
                .build()
                .unwrap();
            engine_b.run_full(vec![spec]).unwrap()
        });
        assert!(a.join().unwrap()[&key("pkg.a@1")].is_done());
        assert!(b.join().unwrap()[&key("pkg.b@1")].is_done());
    });

    assert_eq!(count_of(&installs_a), 1);
    assert_eq!(count_of(&installs_b), 1);
}

#[test]
fn option_variants_occupy_distinct_entries() {
    let bed = TestBed::new();
    let installs = counter();

    let engine = bed.engine();
    let plain = RecipeSpec::builder(id("lib.z@1"))
        .on_install(install_payload(&installs, "plain"))
        .build()
        .unwrap();
    let tuned = RecipeSpec::builder(id("lib.z@1"))
        .option("static", true)
        .on_install(install_payload(&installs, "tuned"))
        .build()
        .unwrap();

    let outcomes = engine.run_full(vec![plain, tuned]).unwrap();
    assert_eq!(outcomes.len(), 2, "two keys for one identity");
    assert!(outcomes.values().all(RecipeOutcome::is_done));
    assert_eq!(count_of(&installs), 2, "each variant builds its own entry");

    let plain_view = engine.find_exact(&key("lib.z@1")).unwrap();
    assert_eq!(
        fs::read_to_string(
            plain_view
                .asset_path
                .unwrap()
                .join("payload.txt")
                .as_std_path()
        )
        .unwrap(),
        "plain"
    );
}
