//! JNI adapter for the Android host.
//!
//! Thin shims from `org.stvp.client.StvpBridge` native methods onto the
//! handle bridge, plus a [`HostCallbacks`] implementation that holds a
//! global reference to the Java-side listener and attaches the calling
//! engine thread to the VM before every callback. Threads stay attached
//! for their lifetime; they detach when they exit, which happens at
//! handle teardown.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use jni::objects::{GlobalRef, JClass, JObject, JString, JValue};
use jni::sys::{jboolean, jint, jlong, jlongArray, jstring, JNI_VERSION_1_6};
use jni::{JNIEnv, JavaVM};

use crate::bridge::{self, HostCallbacks};

static JAVA_VM: OnceLock<JavaVM> = OnceLock::new();

#[unsafe(no_mangle)]
pub extern "system" fn JNI_OnLoad(vm: JavaVM, _reserved: *mut c_void) -> jint {
    let _ = JAVA_VM.set(vm);
    JNI_VERSION_1_6
}

/// Read a Java string, falling back to empty on marshaling failure.
fn jstr(env: &mut JNIEnv, s: &JString) -> String {
    env.get_string(s).map(Into::into).unwrap_or_default()
}

// =============================================================================
// CALLBACKS INTO JAVA
// =============================================================================

struct JniCallbacks {
    listener: GlobalRef,
}

impl JniCallbacks {
    fn with_env(&self, f: impl FnOnce(&mut JNIEnv, &JObject) -> jni::errors::Result<()>) {
        let Some(vm) = JAVA_VM.get() else { return };
        let Ok(mut env) = vm.attach_current_thread_permanently() else { return };
        if f(&mut env, self.listener.as_obj()).is_err() {
            let _ = env.exception_clear();
        }
    }
}

impl HostCallbacks for JniCallbacks {
    fn on_connection_established(&self, client_ip: &str, subnet_mask: &str, primary_dns: &str) {
        self.with_env(|env, listener| {
            let ip = env.new_string(client_ip)?;
            let mask = env.new_string(subnet_mask)?;
            let dns = env.new_string(primary_dns)?;
            env.call_method(
                listener,
                "onConnectionEstablished",
                "(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;)V",
                &[(&ip).into(), (&mask).into(), (&dns).into()],
            )?;
            Ok(())
        });
    }

    fn on_disconnected(&self, reason: i32) {
        self.with_env(|env, listener| {
            env.call_method(listener, "onDisconnected", "(I)V", &[JValue::Int(reason)])?;
            Ok(())
        });
    }

    fn on_error(&self, code: i32, message: &str) {
        self.with_env(|env, listener| {
            let message = env.new_string(message)?;
            env.call_method(
                listener,
                "onError",
                "(ILjava/lang/String;)V",
                &[JValue::Int(code), (&message).into()],
            )?;
            Ok(())
        });
    }

    fn on_bytes_transferred(&self, sent: u64, received: u64) {
        self.with_env(|env, listener| {
            env.call_method(
                listener,
                "onBytesTransferred",
                "(JJ)V",
                &[JValue::Long(sent as i64), JValue::Long(received as i64)],
            )?;
            Ok(())
        });
    }
}

// =============================================================================
// NATIVE METHODS
// =============================================================================

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_stvp_client_StvpBridge_nativeInit<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    listener: JObject<'local>,
) -> jlong {
    let handle = bridge::init();
    if !listener.is_null()
        && let Ok(global) = env.new_global_ref(&listener)
    {
        bridge::set_callbacks(handle, Arc::new(JniCallbacks { listener: global }));
    }
    handle
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_stvp_client_StvpBridge_nativeCleanup<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) {
    bridge::cleanup(handle);
}

#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub extern "system" fn Java_org_stvp_client_StvpBridge_nativeConnect<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
    host: JString<'local>,
    port: jint,
    hub: JString<'local>,
    username: JString<'local>,
    password: JString<'local>,
    use_encrypt: jboolean,
    use_compress: jboolean,
    verify_cert: jboolean,
    tunnel_fd: jint,
) -> jboolean {
    let host = jstr(&mut env, &host);
    let hub = jstr(&mut env, &hub);
    let username = jstr(&mut env, &username);
    let password = jstr(&mut env, &password);

    bridge::connect(
        handle,
        &host,
        port as u16,
        &hub,
        &username,
        &password,
        use_encrypt != 0,
        use_compress != 0,
        verify_cert != 0,
        tunnel_fd,
    ) as jboolean
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_stvp_client_StvpBridge_nativeDisconnect<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) {
    bridge::disconnect(handle);
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_stvp_client_StvpBridge_nativeGetStatus<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) -> jint {
    bridge::get_status(handle)
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_stvp_client_StvpBridge_nativeGetStatistics<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) -> jlongArray {
    let (sent, received) = bridge::get_statistics(handle);
    match env.new_long_array(2) {
        Ok(array) => {
            let _ = env.set_long_array_region(&array, 0, &[sent as i64, received as i64]);
            array.into_raw()
        }
        Err(_) => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_stvp_client_StvpBridge_nativeGetLastError<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) -> jint {
    bridge::get_last_error(handle)
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_stvp_client_StvpBridge_nativeGetErrorString<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) -> jstring {
    match env.new_string(bridge::get_error_string(handle)) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_stvp_client_StvpBridge_nativeTestConnect<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    host: JString<'local>,
    port: jint,
    hub: JString<'local>,
    username: JString<'local>,
    password: JString<'local>,
) -> jint {
    let host = jstr(&mut env, &host);
    let hub = jstr(&mut env, &hub);
    let username = jstr(&mut env, &username);
    let password = jstr(&mut env, &password);
    bridge::test_connect(&host, port as u16, &hub, &username, &password)
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_stvp_client_StvpBridge_nativeTestEcho<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    text: JString<'local>,
) -> jstring {
    let text = jstr(&mut env, &text);
    match env.new_string(bridge::test_echo(&text)) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}
