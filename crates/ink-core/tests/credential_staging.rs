mod support;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ink_core::credentials::{CredentialProvider, StaticCredentialProvider};
use ink_core::models::{
    BackendOptions, ClusterId, CoreError, CoreErrorKind, CoreResult, JobKey, JobSpec, SiteId,
    SlurmOptions,
};
use ink_core::persistence::JobStore;
use support::Harness;

const TICKET: &[u8] = b"\x05\x04krb5-ticket-for-alice";

/// Every test here stages `krb5cc_1001_<stamp>` in the shared temp dir.
static LOCAL_CREDENTIALS: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    LOCAL_CREDENTIALS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

struct RefusingProvider;

impl CredentialProvider for RefusingProvider {
    fn delegated_credential(&self, username: &str) -> CoreResult<Vec<u8>> {
        Err(CoreError::new(
            CoreErrorKind::CredentialError,
            format!("kdc refused to issue a ticket for {username}"),
        ))
    }
}

fn common_spec() -> JobSpec {
    JobSpec {
        job_type: "common".to_string(),
        job_name: None,
        cpu: 1,
        mem_mb: 2048,
        gpu_num: 0,
        arguments: None,
        backend: BackendOptions::Slurm(SlurmOptions::default()),
    }
}

fn ticket_provider() -> Option<Arc<dyn CredentialProvider>> {
    Some(Arc::new(StaticCredentialProvider::new(TICKET)))
}

/// The local ccache handed to aklog through `KRB5CCNAME`.
fn refreshed_ccache(harness: &Harness) -> PathBuf {
    let env = harness
        .executor
        .env_of(support::AKLOG)
        .expect("aklog should have run");
    PathBuf::from(&env["KRB5CCNAME"])
}

fn assert_uploaded_ticket(job_dir: &Path) {
    let uploaded = job_dir.join(format!("krb5cc_{}", support::UID));
    assert_eq!(std::fs::read(&uploaded).unwrap(), TICKET);
    let mode = std::fs::metadata(&uploaded).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ihep_submit_uploads_the_ticket_and_removes_the_local_copy() {
    let _serial = serial();
    let harness = Harness::for_site("cred-ihep", &[], SiteId::Ihep, ticket_provider());
    harness.executor.respond(support::AKLOG, "");
    harness.executor.respond("sbatch", "4821\n");

    let outcome = harness
        .service
        .submit(support::USERNAME, "slurm", common_spec())
        .await
        .unwrap();

    let job_dir = Path::new(&outcome.job_dir);
    assert!(job_dir.starts_with(harness.jobs_root()));
    assert_uploaded_ticket(job_dir);

    let ccache = refreshed_ccache(&harness);
    let name = ccache.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("krb5cc_1001_"), "{name}");
    assert_eq!(ccache.parent(), Some(std::env::temp_dir().as_path()));
    assert!(!ccache.exists(), "{} was left behind", ccache.display());

    let calls = harness.executor.calls();
    let refresh = calls.iter().position(|call| call == support::AKLOG).unwrap();
    let submit = calls.iter().position(|call| call.contains("sbatch")).unwrap();
    assert!(refresh < submit, "{calls:?}");
    assert!(
        calls[submit].contains(&format!(
            "export KRB5CCNAME='{}/krb5cc_1001'",
            outcome.job_dir
        )),
        "{}",
        calls[submit]
    );
    assert!(calls[submit].contains("/usr/bin/aklog && 'sbatch'"), "{}", calls[submit]);

    let key = JobKey::new(support::UID, "4821", ClusterId::Slurm);
    assert!(harness.store.find_job(&key).unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_sbatch_still_removes_the_local_ticket() {
    let _serial = serial();
    let harness = Harness::for_site("cred-ihep-sbatch-fails", &[], SiteId::Ihep, ticket_provider());
    harness.executor.respond(support::AKLOG, "");
    harness
        .executor
        .fail("sbatch", "sbatch: error: Batch job submission failed: Invalid account");

    let error = harness
        .service
        .submit(support::USERNAME, "slurm", common_spec())
        .await
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::CommandFailed);
    let ccache = refreshed_ccache(&harness);
    assert!(!ccache.exists(), "{} was left behind", ccache.display());
    assert!(
        harness
            .store
            .list_user_jobs(support::UID, ClusterId::Slurm)
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_token_refresh_aborts_before_the_scheduler_runs() {
    let _serial = serial();
    let harness = Harness::for_site("cred-ihep-aklog-fails", &[], SiteId::Ihep, ticket_provider());
    harness.executor.fail(support::AKLOG, "aklog: unable to obtain tokens for cell ihep.ac.cn");
    harness.executor.respond("sbatch", "4821\n");

    let error = harness
        .service
        .submit(support::USERNAME, "slurm", common_spec())
        .await
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::CredentialError);
    assert!(error.message.contains("unable to obtain tokens"), "{}", error.message);
    assert!(!refreshed_ccache(&harness).exists());
    assert_eq!(harness.executor.count("sbatch"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provider_errors_abort_the_submit_without_a_record() {
    let _serial = serial();
    let harness = Harness::for_site(
        "cred-ihep-provider-fails",
        &[],
        SiteId::Ihep,
        Some(Arc::new(RefusingProvider)),
    );
    harness.executor.respond("sbatch", "4821\n");

    let error = harness
        .service
        .submit(support::USERNAME, "slurm", common_spec())
        .await
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::CredentialError);
    assert_eq!(error.cluster, Some(ClusterId::Slurm));
    assert!(error.message.contains("kdc refused"), "{}", error.message);
    assert!(harness.executor.calls().is_empty());
    assert!(!harness.jobs_root().exists());
    assert!(
        harness
            .store
            .list_user_jobs(support::UID, ClusterId::Slurm)
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heps_stages_the_ticket_only_when_kerberos_is_enabled() {
    let _serial = serial();
    let kerberos = Harness::for_site("cred-heps-krb5", &[], SiteId::Heps, ticket_provider());
    kerberos.executor.respond(support::AKLOG, "");
    kerberos.executor.respond("sbatch", "77\n");

    let outcome = kerberos
        .service
        .submit(support::USERNAME, "slurm", common_spec())
        .await
        .unwrap();
    assert_uploaded_ticket(Path::new(&outcome.job_dir));
    assert!(!refreshed_ccache(&kerberos).exists());
    let submit = &kerberos.executor.calls()[1];
    assert!(submit.contains("KRB5CCNAME"), "{submit}");

    let plain = Harness::for_site("cred-heps-plain", &[], SiteId::Heps, None);
    plain.executor.respond("sbatch", "78\n");

    let outcome = plain
        .service
        .submit(support::USERNAME, "slurm", common_spec())
        .await
        .unwrap();
    assert!(!Path::new(&outcome.job_dir).join("krb5cc_1001").exists());
    assert_eq!(plain.executor.calls().len(), 1);
    assert!(!plain.executor.calls()[0].contains("KRB5CCNAME"));
}
