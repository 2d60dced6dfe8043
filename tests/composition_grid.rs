use alloyscreen::composition::{
    binary_ratios, dedupe_reduced, mined_binary_ratios, mined_ternary_partitions,
    reduce_partition, select_base_element, ternary_partitions, CompositionGenerator,
};
use alloyscreen::config::CompositionConfig;
use alloyscreen::{ChemicalSystem, Composition};

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_binary_ratio_grid() {
    let ratios = binary_ratios(0.2);
    assert_eq!(ratios, vec![0.2, 0.4, 0.6, 0.8]);

    let ratios = binary_ratios(0.25);
    assert_eq!(ratios, vec![0.25, 0.5, 0.75]);

    // 0.1 must not lose its last step to floating-point flooring.
    assert_eq!(binary_ratios(0.1).len(), 9);
}

#[test]
fn test_binary_ratio_rejects_bad_step() {
    assert!(binary_ratios(0.0).is_empty());
    assert!(binary_ratios(0.6).is_empty());
    assert!(binary_ratios(-0.1).is_empty());
}

#[test]
fn test_ternary_partitions_small_sums() {
    let parts = ternary_partitions(&[3, 4]);
    assert_eq!(parts, vec![[1, 1, 1], [1, 1, 2], [1, 2, 1], [2, 1, 1]]);

    // Sums below 3 cannot hold three positive parts.
    assert!(ternary_partitions(&[2]).is_empty());
}

#[test]
fn test_reduced_partitions_dedupe() {
    assert_eq!(reduce_partition([2, 2, 2]), [1, 1, 1]);
    assert_eq!(reduce_partition([2, 4, 6]), [1, 2, 3]);

    let parts = ternary_partitions(&[3, 6]);
    let before = parts.len();
    let deduped = dedupe_reduced(parts);
    assert!(deduped.len() < before);
    assert_eq!(deduped[0], [1, 1, 1]);
    assert!(!deduped.contains(&[2, 2, 2]));
}

#[test]
fn test_base_element_selection() {
    // fcc beats bcc beats hcp.
    assert_eq!(select_base_element(&strings(&["Fe", "Cr", "Ni"])), Some("Ni".into()));
    assert_eq!(select_base_element(&strings(&["Ti", "V", "Zn"])), Some("V".into()));
    // Same family: the lexicographically first symbol.
    assert_eq!(select_base_element(&strings(&["Ni", "Cu", "Al"])), Some("Al".into()));
    assert_eq!(select_base_element(&[]), None);
}

#[test]
fn test_base_element_unknown_ranks_last() {
    // Sn and Ga have no lattice template.
    assert_eq!(select_base_element(&strings(&["Fe", "Sn", "Ti"])), Some("Fe".into()));
    assert_eq!(select_base_element(&strings(&["Sn", "Mg"])), Some("Mg".into()));
    // All unknown: lexicographic order decides.
    assert_eq!(select_base_element(&strings(&["Sn", "Ga"])), Some("Ga".into()));
}

#[test]
fn test_mined_formulas() {
    let system = ChemicalSystem::new(vec!["Cu", "Ni"]).unwrap();
    let formulas = strings(&["Cu3Ni", "CuNi", "Cu2Ni2", "CuZn", "garbage", "Cu"]);
    let ratios = mined_binary_ratios(&formulas, &system);
    assert_eq!(ratios, vec![0.25, 0.5]);

    let ternary = ChemicalSystem::new(vec!["Fe", "Cr", "Ni"]).unwrap();
    let formulas = strings(&["Fe2Cr2Ni2", "FeCrNi", "Fe2CrNi", "FeNi"]);
    let parts = mined_ternary_partitions(&formulas, &ternary);
    assert_eq!(parts, vec![[1, 1, 1], [2, 1, 1]]);
}

#[tokio::test]
async fn test_generator_builds_compositions() {
    let cfg = CompositionConfig {
        ratio_step: 0.25,
        ternary_sums: vec![3, 4],
        ..Default::default()
    };
    let generator = CompositionGenerator::new(cfg, None);

    let binary = ChemicalSystem::new(vec!["Cu", "Ni"]).unwrap();
    let comps = generator.compositions(&binary).await;
    assert_eq!(comps.len(), 3);
    assert!(matches!(
        &comps[0],
        Composition::Binary { base, dopant, .. } if base == "Cu" && dopant == "Ni"
    ));

    let ternary = ChemicalSystem::new(vec!["Fe", "Cr", "Ni"]).unwrap();
    let comps = generator.compositions(&ternary).await;
    let tags: Vec<String> = comps.iter().map(|c| c.tag()).collect();
    assert_eq!(tags, vec!["1:1:1", "1:1:2", "1:2:1", "2:1:1"]);

    let pure = CompositionGenerator::pure_compositions(&ternary);
    let tags: Vec<String> = pure.iter().map(|c| c.tag()).collect();
    assert_eq!(tags, vec!["pure:Fe", "pure:Cr", "pure:Ni"]);
}
