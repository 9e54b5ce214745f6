fn main() {
    tonic_build::configure()
        .build_server(true)
        .compile(&["proto/csi.proto", "proto/node_plugin.proto"], &["proto"])
        .expect("csi protobuf compilation failed");
}
