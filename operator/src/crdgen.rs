//! Print the CRD schema as YAML.
use kube::CustomResourceExt;

use quarry_operator::cluster::SearchCluster;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&SearchCluster::crd()).expect("CRD should serialize")
    );
}
