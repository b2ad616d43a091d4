/*!
# Fleet DevKit - Doubles de test et scénarios pour le kernel de flotte

Bibliothèque facilitant les tests du kernel sans réseau ni hôte distant :
- Prober scripté (up, down, erreur, blocage, panic)
- SSH simulé avec système de fichiers par hôte et pannes injectables
- Store avec commits défaillants à la demande
- Notifier enregistreur, horloge fixe, harness complet
*/

pub mod fixtures;
pub mod notifier_stub;
pub mod prober_stub;
pub mod remote_stub;
pub mod store_stub;
pub mod test_utils;

pub use fixtures::{FixedClock, HostBuilder};
pub use notifier_stub::RecordingNotifier;
pub use prober_stub::{ProbeBehaviour, ScriptedProber};
pub use remote_stub::MockRemoteExecutor;
pub use store_stub::FlakyStore;
pub use test_utils::FleetHarness;
