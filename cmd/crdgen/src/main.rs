use vertiop_autoscaler::crd::VerticaAutoscaler;
use vertiop_eventtrigger::crd::EventTrigger;
use vertiop_operator::vdb::crd::VerticaDB;
use vertiop_replicator::crd::VerticaReplicator;
use vertiop_restorepoints::crd::VerticaRestorePointsQuery;
use vertiop_scrutinize::crd::VerticaScrutinize;

use kube::CustomResourceExt;

fn main() {
    for crd in vec![
        VerticaDB::crd(),
        VerticaAutoscaler::crd(),
        VerticaReplicator::crd(),
        VerticaRestorePointsQuery::crd(),
        VerticaScrutinize::crd(),
        EventTrigger::crd(),
    ] {
        // safe unwrap: we know CRD is serializable
        print!("---\n{}\n", serde_yaml::to_string(&crd).unwrap());
    }
}
