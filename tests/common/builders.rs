//! Test data builders for object graphs and tracker sessions

use pipehub::message::PortKind;
use pipehub::object::{Meta, Object, ObjectType, SharedRegion};
use pipehub::parameter::{ParamType, ParamValue};
use pipehub::{Message, Payload};

use super::{add_parameter, add_port, hub, module, set_parameter, spawn};

/// Builds a chain of `nested` child objects below a top object, with
/// `arrays` float arrays spread over the chain.
pub struct ObjectGraphBuilder {
    nested: usize,
    arrays: usize,
    object_type: ObjectType,
}

impl ObjectGraphBuilder {
    pub fn new() -> Self {
        Self {
            nested: 0,
            arrays: 0,
            object_type: ObjectType::UnstructuredGrid,
        }
    }

    pub fn nested(mut self, n: usize) -> Self {
        self.nested = n;
        self
    }

    pub fn arrays(mut self, m: usize) -> Self {
        self.arrays = m;
        self
    }

    pub fn object_type(mut self, ty: ObjectType) -> Self {
        self.object_type = ty;
        self
    }

    pub fn build(self, region: &SharedRegion) -> Object {
        let top = region.create_object(self.object_type, Meta::default().with_timestep(0, 1));
        top.add_attribute("_species", "top");

        let mut chain = vec![top.clone()];
        for i in 0..self.nested {
            let child = region.create_object(
                ObjectType::Vec(1),
                Meta::default().with_block(i as i32, self.nested as i32),
            );
            child.add_attribute("_depth", &(i + 1).to_string());
            chain
                .last()
                .expect("chain starts with the top object")
                .set_child("next", &child)
                .expect("fresh child cannot form a cycle");
            chain.push(child);
        }

        for j in 0..self.arrays {
            let holder = &chain[j % chain.len()];
            let values: Vec<f32> = (0..=j).map(|v| v as f32 * 0.5).collect();
            holder.set_array(&format!("a{j}"), region.create_vector_from(values));
        }
        top
    }
}

impl Default for ObjectGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare two graphs by name, type, meta, attributes, array contents and
/// children.
pub fn assert_same_graph(a: &Object, b: &Object) {
    assert_eq!(a.name(), b.name());
    assert_eq!(a.object_type(), b.object_type());
    assert_eq!(a.meta(), b.meta());
    assert_eq!(a.attributes(), b.attributes());

    assert_eq!(a.array_roles(), b.array_roles());
    for role in a.array_roles() {
        let (x, y) = (a.array(&role).unwrap(), b.array(&role).unwrap());
        assert_eq!(x.name(), y.name());
        assert_eq!(x.buffer(), y.buffer(), "array {role} of {}", a.name());
    }

    assert_eq!(a.child_roles(), b.child_roles());
    for role in a.child_roles() {
        assert_same_graph(&a.child(&role).unwrap(), &b.child(&role).unwrap());
    }
}

/// A two-module session: `Gen` (id 1) feeding `Show` (id 2), with one
/// parameter on each side.
pub fn two_module_session() -> Vec<Message> {
    vec![
        spawn(1, "Gen"),
        spawn(2, "Show"),
        module(1).make(Payload::Started { name: "Gen".into() }),
        module(2).make(Payload::Started { name: "Show".into() }),
        add_port(1, "data_out", PortKind::Output),
        add_port(2, "data_in", PortKind::Input),
        add_parameter(1, "size", ParamType::Integer),
        set_parameter(1, "size", ParamValue::Integer(16)),
        add_parameter(2, "label", ParamType::String),
        set_parameter(2, "label", ParamValue::String("hello".into())),
        hub().make(Payload::connect(
            pipehub::Id(1),
            "data_out",
            pipehub::Id(2),
            "data_in",
        )),
        module(2).make(Payload::Busy),
    ]
}
