//! End-to-end replication runs over the loopback test bed.

use glam::Vec3;
use netsync_core::{
    Authority, ComponentMap, ConnectionId, EntityStore, EntityStoreExt, NetComponent, NetId,
    NetworkIdentity, PlayerInput, SyncRule, Transform, IDENTITY_COMPONENT,
};
use netsync_testkit::{Testbed, TestbedConfig};

fn walk(strafe: f32) -> PlayerInput {
    PlayerInput {
        forward: 1.0,
        strafe,
        ..PlayerInput::idle()
    }
}

fn client_position(bed: &Testbed, id: ConnectionId, net_id: NetId) -> Option<Vec3> {
    let client = bed.client(id)?;
    let entity = client.registry().borrow().resolve(net_id)?;
    client
        .world()
        .get_typed::<Transform>(entity)
        .and_then(Result::ok)
        .map(|t| t.position)
}

fn server_position(bed: &Testbed, net_id: NetId) -> Option<Vec3> {
    let entity = bed.server().registry().borrow().resolve(net_id)?;
    bed.server()
        .world()
        .get_typed::<Transform>(entity)
        .and_then(Result::ok)
        .map(|t| t.position)
}

fn spawn_prop(bed: &mut Testbed, position: Vec3) -> <netsync_ecs::HostWorld as EntityStore>::Entity {
    let identity =
        NetworkIdentity::new(Authority::Server).sync(Transform::NAME, SyncRule::rate(0.0));
    bed.server_mut().world_mut().spawn(
        ComponentMap::new()
            .with(Transform::NAME, Transform::from_position(position).to_value())
            .with(IDENTITY_COMPONENT, identity.to_value()),
    )
}

#[test]
fn test_late_join_receives_world_with_hierarchy() {
    let mut bed = Testbed::new(TestbedConfig::default());
    let a = bed.add_client(Some(Vec3::ZERO)).expect("client a");
    let prop = spawn_prop(&mut bed, Vec3::new(1.0, 0.0, 0.0));
    let child = spawn_prop(&mut bed, Vec3::new(1.0, 1.0, 0.0));
    bed.server_mut().world_mut().set_parent(child, Some(prop));

    bed.client_mut(a).expect("a").apply_input(walk(0.0));
    bed.run(30).expect("run");

    let b = bed.add_client(None).expect("late client");
    bed.run(2).expect("run");

    let (prop_id, child_id) = {
        let registry = bed.server().registry().borrow();
        (
            registry.net_id_of(prop).expect("prop announced"),
            registry.net_id_of(child).expect("child announced"),
        )
    };
    let late = bed.client(b).expect("b");
    assert_eq!(late.world().len(), 3);
    let registry = late.registry().borrow();
    let prop_entity = registry.resolve(prop_id).expect("prop");
    let child_entity = registry.resolve(child_id).expect("child");
    assert_eq!(late.world().parent(child_entity), Some(prop_entity));

    let server_z = server_position(&bed, NetId(1)).expect("character").z;
    let late_z = client_position(&bed, b, NetId(1)).expect("character on b").z;
    assert!(server_z < -1.0);
    assert!((late_z - server_z).abs() < 0.5, "late joiner sees a recent state");
}

#[test]
fn test_client_owned_entity_is_relayed() {
    let mut bed = Testbed::new(TestbedConfig::default());
    let a = bed.add_client(None).expect("client a");
    let b = bed.add_client(None).expect("client b");
    bed.run(2).expect("identities");

    let identity =
        NetworkIdentity::new(Authority::Owner).sync(Transform::NAME, SyncRule::rate(0.0));
    let entity = bed.client_mut(a).expect("a").world_mut().spawn(
        ComponentMap::new()
            .with(Transform::NAME, Transform::default().to_value())
            .with(IDENTITY_COMPONENT, identity.to_value()),
    );
    bed.run(3).expect("spawn relay");

    let net_id = NetId(10_001);
    assert!(bed.server().registry().borrow().resolve(net_id).is_some());
    assert_eq!(client_position(&bed, b, net_id), Some(Vec3::ZERO));

    bed.client_mut(a)
        .expect("a")
        .world_mut()
        .set_typed(entity, &Transform::from_position(Vec3::new(5.0, 0.0, 0.0)));
    bed.run(3).expect("update relay");

    assert_eq!(client_position(&bed, b, net_id), Some(Vec3::new(5.0, 0.0, 0.0)));
    let relayed = bed.client(b).expect("b");
    let entity_on_b = relayed.registry().borrow().resolve(net_id).expect("known");
    let identity_on_b = relayed
        .world()
        .get_typed::<NetworkIdentity>(entity_on_b)
        .expect("identity")
        .expect("valid");
    assert_eq!(identity_on_b.authority, Authority::Remote);
    assert_eq!(identity_on_b.owner_client, Some(a));
}

#[test]
fn test_disconnect_despawns_character_everywhere() {
    let mut bed = Testbed::new(TestbedConfig::default());
    let a = bed.add_client(Some(Vec3::ZERO)).expect("client a");
    let b = bed.add_client(Some(Vec3::new(2.0, 0.0, 0.0))).expect("client b");
    bed.run(3).expect("run");
    assert_eq!(bed.client(b).map(|c| c.world().len()), Some(2));

    bed.remove_client(a).expect("remove");
    bed.run(2).expect("run");

    let remaining = bed.client(b).expect("b");
    assert_eq!(remaining.world().len(), 1);
    assert!(remaining.registry().borrow().resolve(NetId(1)).is_none());
    assert_eq!(bed.server().client_count(), 1);
    assert!(bed.server().registry().borrow().is_forgotten(NetId(1)));
}

#[test]
fn test_lost_entity_is_recovered_by_resync() {
    let mut bed = Testbed::new(TestbedConfig::default());
    let a = bed.add_client(Some(Vec3::ZERO)).expect("client a");
    let b = bed.add_client(None).expect("client b");
    bed.run(3).expect("run");

    {
        let observer = bed.client_mut(b).expect("b");
        let entity = observer.registry().borrow().resolve(NetId(1)).expect("known");
        observer.registry().borrow_mut().unregister(NetId(1));
        observer.world_mut().despawn(entity);
    }
    assert!(client_position(&bed, b, NetId(1)).is_none());

    bed.client_mut(a).expect("a").apply_input(walk(0.0));
    bed.run(20).expect("run");

    let observer = bed.client(b).expect("b");
    assert!(observer.inbound_stats().unknown >= 1);
    assert!(observer.registry().borrow().resolve(NetId(1)).is_some());
    assert_eq!(observer.world().len(), 1);
}

#[test]
fn test_prediction_converges_under_loss() {
    let mut config = TestbedConfig {
        loss: 0.2,
        seed: 7,
        ..TestbedConfig::default()
    };
    config.net.prediction.max_inputs_per_message = 64;
    let mut bed = Testbed::new(config);
    let a = bed.add_client(Some(Vec3::ZERO)).expect("client a");

    for phase in 0..6 {
        let strafe = if phase % 2 == 0 { 1.0 } else { -1.0 };
        bed.client_mut(a).expect("a").apply_input(walk(strafe));
        bed.run(20).expect("run");
    }
    bed.client_mut(a).expect("a").apply_input(PlayerInput::idle());
    bed.run(60).expect("settle");

    let predicted = client_position(&bed, a, NetId(1)).expect("predicted");
    let authoritative = server_position(&bed, NetId(1)).expect("server");
    assert!(authoritative.z < -5.0);
    assert!(
        predicted.distance(authoritative) < 0.05,
        "predicted {predicted} vs server {authoritative}"
    );
    assert!(bed.link_stats().dropped > 0);

    let report = bed.report("lossy");
    assert!(report.prediction.predictions >= 170);
    assert!(report.prediction.reconciliations > 0);
}
