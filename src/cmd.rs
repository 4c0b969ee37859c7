//! Launch-time argument marshaling.
//!
//! Everything the child needs between `fork()` and `execve()` is prepared
//! here, ahead of the fork: post-fork code in the child may not allocate, so
//! every path, argument, and environment string is converted to an owned,
//! NUL-terminated form while still single-threaded-safe to do so.

use std::ffi::CString;
use std::ffi::NulError;
use std::os::raw::c_char;
use std::path::PathBuf;

/// How to start the inferior.
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    /// Program image to exec.
    pub program: PathBuf,

    /// Argument vector, `argv[0]` included. When empty, the program path is
    /// used as `argv[0]`.
    pub argv: Vec<String>,

    /// Environment as `KEY=VALUE` strings. When empty, the parent
    /// environment is inherited.
    pub env: Vec<String>,

    /// Redirect the child's stdin/stdout/stderr to these paths. Descriptors
    /// left as `None` stay connected to the pseudo-terminal slave.
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,

    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,

    /// Clear the address-space-layout-randomization personality bit before
    /// exec.
    pub disable_aslr: bool,
}

impl LaunchOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            argv: Vec::new(),
            env: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            working_dir: None,
            disable_aslr: false,
        }
    }
}

/// Pre-fork image of a launch: owned NUL-terminated strings only.
pub(crate) struct ExecImage {
    pub(crate) program: CString,
    pub(crate) argv: Vec<CString>,
    pub(crate) env: Vec<CString>,
    pub(crate) stdin: Option<CString>,
    pub(crate) stdout: Option<CString>,
    pub(crate) stderr: Option<CString>,
    pub(crate) working_dir: Option<CString>,
    pub(crate) disable_aslr: bool,
}

fn path_cstring(path: &PathBuf) -> Result<CString, NulError> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes())
}

impl ExecImage {
    pub(crate) fn prepare(options: &LaunchOptions) -> Result<Self, NulError> {
        let program = path_cstring(&options.program)?;

        let argv = if options.argv.is_empty() {
            vec![program.clone()]
        } else {
            options
                .argv
                .iter()
                .map(|arg| CString::new(arg.as_bytes()))
                .collect::<Result<_, _>>()?
        };

        let env = if options.env.is_empty() {
            inherited_env()
        } else {
            options
                .env
                .iter()
                .map(|kv| CString::new(kv.as_bytes()))
                .collect::<Result<_, _>>()?
        };

        Ok(Self {
            program,
            argv,
            env,
            stdin: options.stdin.as_ref().map(path_cstring).transpose()?,
            stdout: options.stdout.as_ref().map(path_cstring).transpose()?,
            stderr: options.stderr.as_ref().map(path_cstring).transpose()?,
            working_dir: options.working_dir.as_ref().map(path_cstring).transpose()?,
            disable_aslr: options.disable_aslr,
        })
    }

    /// Builds the exec-ready argv and envp pointer tables. This allocates,
    /// so it must run before the fork; the tables stay valid for as long
    /// as the image they borrow from.
    pub(crate) fn vectors(&self) -> ExecVectors<'_> {
        ExecVectors {
            argv: pointer_table(&self.argv),
            envp: pointer_table(&self.env),
            _image: self,
        }
    }
}

/// The parent environment as `KEY=VALUE` CStrings. An entry with an
/// interior NUL byte cannot cross `execve` and is dropped.
fn inherited_env() -> Vec<CString> {
    use std::os::unix::ffi::{OsStrExt, OsStringExt};

    std::env::vars_os()
        .filter_map(|(key, value)| {
            let mut kv = key.into_vec();
            kv.push(b'=');
            kv.extend_from_slice(value.as_bytes());

            CString::new(kv).ok()
        })
        .collect()
}

fn pointer_table(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Argument and environment tables in the shape `execve` wants: arrays of
/// string pointers, each with a terminating NULL entry. The borrow of the
/// image keeps every pointed-to string alive.
pub(crate) struct ExecVectors<'a> {
    argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
    _image: &'a ExecImage,
}

impl ExecVectors<'_> {
    pub(crate) fn argv_ptr(&self) -> *const *const c_char {
        self.argv.as_ptr()
    }

    pub(crate) fn envp_ptr(&self) -> *const *const c_char {
        self.envp.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_defaults_to_the_program_path() {
        let options = LaunchOptions::new("/bin/true");
        let image = ExecImage::prepare(&options).unwrap();

        assert_eq!(image.argv.len(), 1);
        assert_eq!(image.argv[0].to_bytes(), b"/bin/true");
    }

    #[test]
    fn empty_env_inherits_the_parent() {
        std::env::set_var("PROCMON_CMD_TEST", "1");

        let options = LaunchOptions::new("/bin/true");
        let image = ExecImage::prepare(&options).unwrap();

        assert!(image
            .env
            .iter()
            .any(|kv| kv.to_bytes().starts_with(b"PROCMON_CMD_TEST=")));
    }

    #[test]
    fn explicit_env_is_passed_verbatim() {
        let mut options = LaunchOptions::new("/bin/true");
        options.env = vec!["ONLY=this".into()];

        let image = ExecImage::prepare(&options).unwrap();

        assert_eq!(image.env.len(), 1);
        assert_eq!(image.env[0].to_bytes(), b"ONLY=this");
    }

    #[test]
    fn exec_vectors_are_null_terminated() {
        let mut options = LaunchOptions::new("/bin/true");
        options.argv = vec!["true".into(), "--version".into()];
        options.env = vec!["A=1".into(), "B=2".into()];

        let image = ExecImage::prepare(&options).unwrap();
        let vectors = image.vectors();

        assert_eq!(vectors.argv.len(), 3);
        assert!(vectors.argv[2].is_null());
        assert!(vectors.argv.iter().take(2).all(|p| !p.is_null()));

        assert_eq!(vectors.envp.len(), 3);
        assert!(vectors.envp[2].is_null());
    }

    #[test]
    fn interior_nul_is_rejected() {
        let mut options = LaunchOptions::new("/bin/true");
        options.argv = vec!["bad\0arg".into()];

        assert!(ExecImage::prepare(&options).is_err());
    }
}
