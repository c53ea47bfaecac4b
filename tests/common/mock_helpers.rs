//! Mock construction helpers

use mockall::mock;
use pipehub::message::TextType;
use pipehub::tracker::{ModuleState, StateObserver};
use pipehub::transport::Liveness;
use pipehub::Id;
use uuid::Uuid;

mock! {
    pub Observer {}

    impl StateObserver for Observer {
        fn new_hub(&self, hub: Id, name: &str);
        fn delete_hub(&self, hub: Id);
        fn module_available(&self, hub: Id, name: &str, path: &str);
        fn new_module(&self, module: Id, spawn_uuid: Uuid, name: &str);
        fn delete_module(&self, module: Id);
        fn module_state_changed(&self, module: Id, state: ModuleState);
        fn new_parameter(&self, module: Id, name: &str);
        fn parameter_value_changed(&self, module: Id, name: &str);
        fn parameter_choices_changed(&self, module: Id, name: &str);
        fn delete_parameter(&self, module: Id, name: &str);
        fn new_port(&self, module: Id, name: &str);
        fn delete_port(&self, module: Id, name: &str);
        fn new_connection(&self, from: Id, from_port: &str, to: Id, to_port: &str);
        fn delete_connection(&self, from: Id, from_port: &str, to: Id, to_port: &str);
        fn info(&self, text: &str, text_type: TextType, sender: Id, rank: i32);
        fn quit_requested(&self);
        fn inc_modification_count(&self);
        fn reset_modification_count(&self);
    }
}

mock! {
    pub Peer {}

    impl Liveness for Peer {
        fn is_alive(&self) -> bool;
    }
}

/// Observer mock that accepts every callback.
pub fn permissive_observer() -> MockObserver {
    let mut o = MockObserver::new();
    o.expect_new_hub().returning(|_, _| ());
    o.expect_delete_hub().returning(|_| ());
    o.expect_module_available().returning(|_, _, _| ());
    o.expect_new_module().returning(|_, _, _| ());
    o.expect_delete_module().returning(|_| ());
    o.expect_module_state_changed().returning(|_, _| ());
    o.expect_new_parameter().returning(|_, _| ());
    o.expect_parameter_value_changed().returning(|_, _| ());
    o.expect_parameter_choices_changed().returning(|_, _| ());
    o.expect_delete_parameter().returning(|_, _| ());
    o.expect_new_port().returning(|_, _| ());
    o.expect_delete_port().returning(|_, _| ());
    o.expect_new_connection().returning(|_, _, _, _| ());
    o.expect_delete_connection().returning(|_, _, _, _| ());
    o.expect_info().returning(|_, _, _, _| ());
    o.expect_quit_requested().returning(|| ());
    o.expect_inc_modification_count().returning(|| ());
    o.expect_reset_modification_count().returning(|| ());
    o
}
