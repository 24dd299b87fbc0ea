mod common;

use anyhow::Result;

use tenant_guard::PolicyRegistry;

#[test]
fn shipped_policy_file_matches_the_fixture_table() -> Result<()> {
    let loaded = PolicyRegistry::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/policies.yaml"))?;
    let fixtures = common::policies();
    assert_eq!(loaded.len(), fixtures.len());

    for expected in &fixtures {
        let policy = loaded.get(&expected.resource_type)?;
        assert_eq!(policy, expected, "policy for {}", expected.resource_type);
    }
    Ok(())
}
