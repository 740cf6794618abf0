//! `fuser::Filesystem` adapter.
//!
//! Every callback is captured into an [`OpParams`] record and handed to the
//! [`Dispatcher`]; none of them decides anything itself.

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::SystemTime;

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyBmap, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyLock, ReplyLseek, ReplyOpen,
    ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tracing::{debug, info};

use crate::codec::{self, SetattrArgs};
use crate::dispatch::Dispatcher;
use crate::handle::FuserHandle;
use crate::op::{Caller, ForgetOne, IoctlData, LockRange, OpParams, Payload, XattrValue};

pub struct BridgeFilesystem {
    dispatcher: Dispatcher,
    readdir_size: u32,
}

impl BridgeFilesystem {
    pub fn new(dispatcher: Dispatcher, readdir_size: u32) -> Self {
        BridgeFilesystem {
            dispatcher,
            readdir_size,
        }
    }

    fn submit(&self, req: &Request<'_>, params: OpParams, reply: impl Into<FuserHandle>) {
        let handle: Box<FuserHandle> = Box::new(reply.into());
        if let Err(e) = self.dispatcher.submit(codec::caller(req), params, handle) {
            debug!("submission rejected: {}", e);
        }
    }
}

impl Filesystem for BridgeFilesystem {
    fn init(&mut self, req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("relayfs init");
        self.dispatcher.notify(codec::caller(req), OpParams::Init)
    }

    fn destroy(&mut self) {
        info!("relayfs destroy");
        if let Err(errno) = self.dispatcher.notify(Caller::default(), OpParams::Destroy) {
            debug!("destroy acknowledged with errno {}", errno);
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let params = OpParams::Lookup {
            parent,
            name: codec::name(name),
        };
        self.submit(req, params, reply);
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        self.dispatcher
            .post(codec::caller(req), OpParams::Forget { ino, nlookup });
    }

    fn batch_forget(&mut self, req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        let items = nodes
            .iter()
            .map(|n| ForgetOne {
                ino: n.nodeid,
                nlookup: n.nlookup,
            })
            .collect();
        self.dispatcher
            .post(codec::caller(req), OpParams::ForgetMulti { items });
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        self.submit(req, OpParams::Getattr { ino, fh }, reply);
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let args = SetattrArgs {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            ctime,
            fh,
        };
        self.submit(req, codec::setattr(ino, args), reply);
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        self.submit(req, OpParams::Readlink { ino }, reply);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let params = OpParams::Mknod {
            parent,
            name: codec::name(name),
            mode,
            umask,
            rdev,
        };
        self.submit(req, params, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let params = OpParams::Mkdir {
            parent,
            name: codec::name(name),
            mode,
            umask,
        };
        self.submit(req, params, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let params = OpParams::Unlink {
            parent,
            name: codec::name(name),
        };
        self.submit(req, params, reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let params = OpParams::Rmdir {
            parent,
            name: codec::name(name),
        };
        self.submit(req, params, reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let params = OpParams::Symlink {
            parent,
            name: codec::name(link_name),
            target: codec::target(target),
        };
        self.submit(req, params, reply);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let params = OpParams::Rename {
            parent,
            name: codec::name(name),
            newparent,
            newname: codec::name(newname),
            flags,
        };
        self.submit(req, params, reply);
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let params = OpParams::Link {
            ino,
            newparent,
            newname: codec::name(newname),
        };
        self.submit(req, params, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.submit(req, OpParams::Open { ino, flags }, reply);
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let params = OpParams::Read {
            ino,
            fh,
            offset,
            size,
            flags,
            lock_owner,
        };
        self.submit(req, params, reply);
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        write_flags: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let params = OpParams::Write {
            ino,
            fh,
            offset,
            data: Payload::copy_from(data),
            write_flags,
            flags,
            lock_owner,
        };
        self.submit(req, params, reply);
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        let params = OpParams::Flush {
            ino,
            fh,
            lock_owner,
        };
        self.submit(req, params, reply);
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        let params = OpParams::Release {
            ino,
            fh,
            flags,
            lock_owner,
            flush,
        };
        self.submit(req, params, reply);
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        self.submit(req, OpParams::Fsync { ino, fh, datasync }, reply);
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.submit(req, OpParams::Opendir { ino, flags }, reply);
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        let params = OpParams::Readdir {
            ino,
            fh,
            offset,
            size: self.readdir_size,
        };
        self.submit(req, params, reply);
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectoryPlus,
    ) {
        let params = OpParams::Readdirplus {
            ino,
            fh,
            offset,
            size: self.readdir_size,
        };
        self.submit(req, params, reply);
    }

    fn releasedir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        reply: ReplyEmpty,
    ) {
        self.submit(req, OpParams::Releasedir { ino, fh, flags }, reply);
    }

    fn fsyncdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        self.submit(req, OpParams::Fsyncdir { ino, fh, datasync }, reply);
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        self.submit(req, OpParams::Statfs { ino }, reply);
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        let params = OpParams::Setxattr {
            ino,
            name: codec::name(name),
            value: XattrValue::copy_from(value),
            flags,
            position,
        };
        self.submit(req, params, reply);
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let params = OpParams::Getxattr {
            ino,
            name: codec::name(name),
            size,
        };
        self.submit(req, params, reply);
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        self.submit(req, OpParams::Listxattr { ino, size }, reply);
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let params = OpParams::Removexattr {
            ino,
            name: codec::name(name),
        };
        self.submit(req, params, reply);
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        self.submit(req, OpParams::Access { ino, mask }, reply);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let params = OpParams::Create {
            parent,
            name: codec::name(name),
            mode,
            umask,
            flags,
        };
        self.submit(req, params, reply);
    }

    fn getlk(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let params = OpParams::Getlk {
            ino,
            fh,
            lock_owner,
            lock: LockRange {
                start,
                end,
                typ,
                pid,
            },
        };
        self.submit(req, params, reply);
    }

    fn setlk(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let params = OpParams::Setlk {
            ino,
            fh,
            lock_owner,
            lock: LockRange {
                start,
                end,
                typ,
                pid,
            },
            sleep,
        };
        self.submit(req, params, reply);
    }

    fn bmap(&mut self, req: &Request<'_>, ino: u64, blocksize: u32, idx: u64, reply: ReplyBmap) {
        self.submit(req, OpParams::Bmap { ino, blocksize, idx }, reply);
    }

    fn ioctl(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: u32,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
        reply: ReplyIoctl,
    ) {
        let params = OpParams::Ioctl {
            ino,
            fh,
            flags,
            cmd,
            in_data: IoctlData::copy_from(in_data),
            out_size,
        };
        self.submit(req, params, reply);
    }

    fn fallocate(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let params = OpParams::Fallocate {
            ino,
            fh,
            offset,
            length,
            mode,
        };
        self.submit(req, params, reply);
    }

    fn lseek(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let params = OpParams::Lseek {
            ino,
            fh,
            offset,
            whence,
        };
        self.submit(req, params, reply);
    }

    fn copy_file_range(
        &mut self,
        req: &Request<'_>,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
        reply: ReplyWrite,
    ) {
        let params = OpParams::CopyFileRange {
            ino_in,
            fh_in,
            offset_in,
            ino_out,
            fh_out,
            offset_out,
            len,
            flags,
        };
        self.submit(req, params, reply);
    }
}
