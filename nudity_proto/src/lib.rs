tonic::include_proto!("nudity_service");

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("nudity");
