//! Registered step names.

// AWS fabric.
pub const FIND_AMI: &str = "find-ami";
pub const CREATE_VPC: &str = "create-vpc";
pub const CREATE_SECURITY_GROUPS: &str = "create-security-groups";
pub const CREATE_INSTANCE_PROFILES: &str = "create-instance-profiles";
pub const IMPORT_KEY_PAIR: &str = "import-key-pair";
pub const CREATE_INTERNET_GATEWAY: &str = "create-internet-gateway";
pub const CREATE_SUBNETS: &str = "create-subnets";
pub const CREATE_ROUTE_TABLE: &str = "create-route-table";
pub const ASSOCIATE_ROUTE_TABLE: &str = "associate-route-table";
pub const CREATE_LOAD_BALANCER: &str = "create-load-balancer";

pub const DELETE_LOAD_BALANCER: &str = "delete-load-balancer";
pub const DISASSOCIATE_ROUTE_TABLE: &str = "disassociate-route-table";
pub const DELETE_ROUTE_TABLE: &str = "delete-route-table";
pub const DELETE_SUBNETS: &str = "delete-subnets";
pub const DELETE_INTERNET_GATEWAY: &str = "delete-internet-gateway";
pub const DELETE_KEY_PAIR: &str = "delete-key-pair";
pub const DELETE_INSTANCE_PROFILES: &str = "delete-instance-profiles";
pub const DELETE_SECURITY_GROUPS: &str = "delete-security-groups";
pub const DELETE_VPC: &str = "delete-vpc";

// Fabric for every other provider.
pub const IMPORT_SSH_KEY: &str = "import-ssh-key";
pub const DELETE_SSH_KEY: &str = "delete-ssh-key";

// Node pipelines.
pub const CREATE_INSTANCE: &str = "create-instance";
pub const INSTALL_CONTAINER_RUNTIME: &str = "install-container-runtime";
pub const KUBELET_CONFIG: &str = "kubelet-config";
pub const INSTALL_KUBELET: &str = "install-kubelet";
pub const KUBEADM_INIT: &str = "kubeadm-init";
pub const POST_START: &str = "post-start";
pub const KUBEADM_JOIN: &str = "kubeadm-join";
pub const DELETE_INSTANCE: &str = "delete-instance";
