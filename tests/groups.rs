//! Secondary-group lifecycle over the internal collective RPCs.

mod common;

use common::{cluster, with_drivers};
use treecast::Error;

#[test]
fn secondary_group_lifecycle() {
    let nodes = cluster(4);

    let grp = with_drivers(&nodes, 0, || {
        nodes[0].rt.group_create(&nodes[0].ctx, "workers", &[0, 1, 3])
    })
    .unwrap();

    assert_eq!(grp.membs(), [0, 1, 3]);
    assert!(!grp.is_primary());

    // Members know the group, the bystander does not.
    assert!(nodes[1].rt.group_lookup("workers").is_some());
    assert!(nodes[3].rt.group_lookup("workers").is_some());
    assert!(nodes[2].rt.group_lookup("workers").is_none());

    // A second create collides locally before anything hits the wire.
    assert_eq!(
        nodes[0]
            .rt
            .group_create(&nodes[0].ctx, "workers", &[0, 1])
            .unwrap_err(),
        Error::Exist
    );

    with_drivers(&nodes, 0, || {
        nodes[0].rt.group_destroy(&nodes[0].ctx, "workers")
    })
    .unwrap();

    for node in &nodes {
        assert!(node.rt.group_lookup("workers").is_none());
    }
    assert_eq!(
        nodes[0].rt.group_destroy(&nodes[0].ctx, "workers").unwrap_err(),
        Error::Nonexist
    );
}

#[test]
fn group_create_requires_membership() {
    let nodes = cluster(3);

    // The initiator must be part of the group it creates.
    assert_eq!(
        nodes[0]
            .rt
            .group_create(&nodes[0].ctx, "others", &[1, 2])
            .unwrap_err(),
        Error::Inval
    );

    // Members must exist in the primary group.
    assert_eq!(
        nodes[0]
            .rt
            .group_create(&nodes[0].ctx, "ghosts", &[0, 9])
            .unwrap_err(),
        Error::Inval
    );
}
