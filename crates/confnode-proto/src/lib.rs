pub mod app {
    pub mod v1 {
        tonic::include_proto!("confnode.app.v1");
    }
}

pub mod pipeline {
    #[allow(clippy::large_enum_variant)]
    pub mod v1 {
        tonic::include_proto!("confnode.pipeline.v1");
    }
}
