fn main() {
    capnpc::CompilerCommand::new()
        .src_prefix("schema")
        .file("schema/debug.capnp")
        .file("schema/agent.capnp")
        .default_parent_module(vec!["operate".to_owned(), "capnp".to_owned()])
        .run()
        .expect("compiled wire schemas");
}
